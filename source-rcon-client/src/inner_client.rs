use crate::config::Terminator;
use crate::events::Listeners;
use crate::frame::FrameReader;
use crate::packet::{Encoding, Packet, PacketType, AUTH_FAILED_ID, AUTH_PACKET_ID};
use crate::request::{Delivery, RequestTable};
use crate::{ConnectionState, ErrorKind, RconConfig};
use log::{debug, error, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

// Frames read ahead of the dispatcher before the pump stops reading the socket
const FRAME_QUEUE_LEN: usize = 64;

/// Connection state shared between the client and the tasks of its current connection.
///
/// Every connection attempt gets a new generation; updates from an older connection are ignored.
#[derive(Debug)]
pub(crate) struct StateCell {
    inner: Mutex<(u64, ConnectionState)>,
}

impl StateCell {
    pub fn new() -> Self {
        StateCell {
            inner: Mutex::new((0, ConnectionState::Disconnected)),
        }
    }

    pub fn get(&self) -> ConnectionState {
        lock(&self.inner).1
    }

    pub fn begin(&self, generation: u64) {
        *lock(&self.inner) = (generation, ConnectionState::Connecting);
    }

    pub fn set(&self, generation: u64, state: ConnectionState) {
        let mut inner = lock(&self.inner);
        if inner.0 == generation {
            inner.1 = state;
        }
    }
}

/// The parts of the configuration the dispatcher needs.
#[derive(Debug, Clone)]
pub(crate) struct DispatchOptions {
    pub terminator: Terminator,
    pub strict_id_matching: bool,
    pub encoding: Encoding,
    pub max_packet_size: usize,
}

impl From<&RconConfig> for DispatchOptions {
    fn from(config: &RconConfig) -> Self {
        DispatchOptions {
            terminator: config.terminator.clone(),
            strict_id_matching: config.strict_id_matching,
            encoding: config.encoding,
            max_packet_size: config.max_packet_size,
        }
    }
}

/// State of one TCP connection, shared by the client and the connection's tasks.
#[derive(Debug)]
pub(crate) struct Connection {
    pub generation: u64,
    pub requests: RequestTable,
    options: DispatchOptions,
    auth: Mutex<Option<oneshot::Sender<bool>>>,
    closed: AtomicBool,
    watched: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
    state: Arc<StateCell>,
    listeners: Arc<Listeners>,
}

impl Connection {
    pub fn new(
        generation: u64,
        options: DispatchOptions,
        state: Arc<StateCell>,
        listeners: Arc<Listeners>,
    ) -> Self {
        Connection {
            generation,
            requests: RequestTable::new(),
            options,
            auth: Mutex::new(None),
            closed: AtomicBool::new(false),
            watched: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            state,
            listeners,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ties a task to the connection so closing the connection aborts it.
    pub fn track(&self, task: AbortHandle) {
        lock(&self.tasks).push(task.clone());

        // The connection may have closed before the task was registered
        if self.is_closed() {
            task.abort();
        }
    }

    /// Returns `true` the first time it's called, for the task that gets to watch the connection.
    pub fn claim_watch(&self) -> bool {
        !self.watched.swap(true, Ordering::SeqCst)
    }

    /// Installs a new authentication slot, replacing any previous one.
    pub fn begin_auth(&self) -> oneshot::Receiver<bool> {
        let (slot, reply) = oneshot::channel();
        *lock(&self.auth) = Some(slot);
        reply
    }

    pub fn cancel_auth(&self) {
        lock(&self.auth).take();
    }

    fn auth_pending(&self) -> bool {
        lock(&self.auth).is_some()
    }

    /// Tears the connection down: fails everything still waiting on it and notifies listeners.
    ///
    /// Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }

        let failed = self.requests.fail_all(|| ErrorKind::ConnectionClosed);
        if failed > 0 {
            debug!("Failed {} pending commands on disconnect", failed);
        }

        // Dropping the slot wakes a pending authentication with a closed error
        self.cancel_auth();

        self.state.set(self.generation, ConnectionState::Disconnected);
        self.listeners.disconnected();
    }

    fn dispatch_frame(&self, frame: &[u8]) {
        let packet = match Packet::decode(frame, self.options.encoding) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("Discarding packet: {}", err);
                return;
            }
        };

        trace!(
            "Received packet {} of type {:?} with {} byte body",
            packet.id,
            packet.packet_type,
            packet.body.len()
        );

        self.listeners.packet_received(&packet);
        self.dispatch_packet(&packet);
    }

    fn dispatch_packet(&self, packet: &Packet) {
        match packet.packet_type {
            PacketType::AuthResponse => {
                match lock(&self.auth).take() {
                    Some(slot) => {
                        let _ = slot.send(packet.id != AUTH_FAILED_ID);
                    }
                    None => warn!("Ignoring unexpected auth response with id {}", packet.id),
                }
                return;
            }

            // Source servers send an empty response ahead of the auth response
            PacketType::Response
                if packet.id == AUTH_PACKET_ID && packet.body.is_empty() && self.auth_pending() =>
            {
                return;
            }

            _ => {}
        }

        match self.requests.deliver(
            packet.id,
            &packet.body,
            self.options.strict_id_matching,
            &self.options.terminator,
        ) {
            Delivery::Completed(id) => trace!("Command {} completed", id),
            Delivery::Buffered(id) => trace!("Buffered partial response for command {}", id),
            Delivery::Unmatched => {
                debug!("Discarding packet {} with no pending command", packet.id)
            }
            Delivery::Discarded => trace!("Discarding terminator marker {}", packet.id),
        }
    }
}

/// Closes the connection when the dispatcher stops for any reason, including being aborted or
/// a listener panicking.
struct CloseOnDrop(Arc<Connection>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// The write half of a connection. Holding the client's lock on it is what serializes writes.
#[derive(Debug)]
pub(crate) struct Session {
    write: OwnedWriteHalf,
    pub conn: Arc<Connection>,
}

impl Session {
    /// Splits the stream and spawns the tasks that read from it.
    pub fn start(stream: TcpStream, conn: Arc<Connection>) -> Self {
        let (read, write) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_LEN);

        let reader = FrameReader::new(read, conn.options.max_packet_size);
        let pump = tokio::spawn(pump_frames(reader, frames_tx, conn.clone()));
        let dispatch = tokio::spawn(dispatch_frames(frames_rx, CloseOnDrop(conn.clone())));
        conn.track(pump.abort_handle());
        conn.track(dispatch.abort_handle());

        Session { write, conn }
    }

    /// Writes `packets` in a single write.
    ///
    /// A failed or timed out write leaves the stream in an unknown state, so it closes the
    /// connection.
    pub async fn send(&mut self, packets: &[Packet], timeout: Duration) -> crate::Result<()> {
        let options = &self.conn.options;
        let mut buf = Vec::new();
        for packet in packets {
            buf.extend(packet.encode(options.encoding, options.max_packet_size)?);
        }

        let result = match tokio::time::timeout(timeout, self.write.write_all(&buf)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(elapsed) => Err(elapsed.into()),
        };

        self.conn.close();
        result
    }

    pub async fn shutdown(mut self) {
        if let Err(err) = self.write.shutdown().await {
            debug!("Error shutting down connection: {}", err);
        }
        self.conn.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.conn.close();
    }
}

async fn pump_frames(
    mut reader: FrameReader<OwnedReadHalf>,
    frames: mpsc::Sender<crate::Result<Vec<u8>>>,
    conn: Arc<Connection>,
) {
    loop {
        let item = match reader.next_frame().await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => {
                debug!("Server closed the connection");
                break;
            }
            Err(err) => Err(err),
        };

        let fatal = item.is_err();
        if frames.send(item).await.is_err() {
            // The dispatcher is gone, nobody is left to close the connection
            conn.close();
            return;
        }
        if fatal {
            break;
        }
    }

    // Dropping the sender lets the dispatcher drain what was read and then close the connection
}

async fn dispatch_frames(
    mut frames: mpsc::Receiver<crate::Result<Vec<u8>>>,
    conn: CloseOnDrop,
) {
    while let Some(item) = frames.recv().await {
        match item {
            Ok(frame) => conn.0.dispatch_frame(&frame),
            Err(err) => {
                error!("Closing connection: {}", err);
                break;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
