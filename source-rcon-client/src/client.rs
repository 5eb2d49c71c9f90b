use crate::events::{Listeners, Parser};
use crate::inner_client::{Connection, DispatchOptions, Session, StateCell};
use crate::packet::{Packet, PacketType, AUTH_PACKET_ID};
use crate::{ErrorKind, RconConfig};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;

// A console comment, which Source servers answer with an empty response
const DISCONNECTION_CHECK_COMMAND: &str = "//ping";

type SharedSession = tokio::sync::Mutex<Option<Session>>;

/// Lifecycle of the connection owned by an [`RconClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, waiting for or retrying authentication.
    Authenticating,
    Ready,
}

/// Outcome of a failed authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The server rejected the password. The connection stays open so another password can be
    /// tried.
    #[error("invalid password")]
    InvalidPassword,

    #[error(transparent)]
    Fatal(crate::Error),
}

impl From<AuthError> for ErrorKind {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidPassword => ErrorKind::AuthenticationFailed,
            AuthError::Fatal(err) => err.into_kind(),
        }
    }
}

/// An RCON client.
///
/// All methods take `&self`, so a client can be shared between tasks (e.g. in an [`Arc`]) and
/// used to send several commands at once.
#[derive(Debug)]
pub struct RconClient {
    config: RconConfig,
    password: Mutex<String>,
    state: Arc<StateCell>,
    listeners: Arc<Listeners>,
    // Lock around "allocate id, register, write". Never held while waiting for a response.
    session: Arc<SharedSession>,
    connect_lock: tokio::sync::Mutex<()>,
    next_id: Arc<AtomicI32>,
    generation: AtomicU64,
}

impl RconClient {
    pub fn new(config: RconConfig) -> Self {
        RconClient {
            password: Mutex::new(config.password.clone()),
            config,
            state: Arc::new(StateCell::new()),
            listeners: Arc::new(Listeners::default()),
            session: Arc::new(tokio::sync::Mutex::new(None)),
            connect_lock: tokio::sync::Mutex::new(()),
            next_id: Arc::new(AtomicI32::new(1)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RconConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Authenticating | ConnectionState::Ready
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Changes the password used by the next connection or authentication.
    pub fn set_password(&self, password: &str) {
        *self.password.lock().unwrap_or_else(|err| err.into_inner()) = password.to_string();
    }

    fn password(&self) -> String {
        self.password
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Calls `listener` every time a connection of this client closes.
    pub fn on_disconnected<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.on_disconnected(Arc::new(listener));
    }

    /// Calls `listener` with every packet received, before it's matched to a command.
    pub fn on_packet<F>(&self, listener: F)
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.listeners.on_packet(Arc::new(listener));
    }

    /// Calls `listener` with the body of every non-empty packet received.
    pub fn on_body<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.on_body(Arc::new(listener));
    }

    /// Runs `parser` on the body of every non-empty packet received and calls `callback` with
    /// each value it produces.
    pub fn listen<P, C>(&self, parser: P, callback: C)
    where
        P: Parser + 'static,
        C: Fn(P::Output) + Send + Sync + 'static,
    {
        self.listeners.listen(parser, callback);
    }

    /// Number of commands sent on the current connection that haven't been answered yet.
    pub async fn pending_commands(&self) -> usize {
        match self.session.lock().await.as_ref() {
            Some(session) => session.conn.requests.len(),
            None => 0,
        }
    }

    /// Connects to the server and authenticates with the configured password.
    ///
    /// Does nothing if the client is already connected and authenticated. If the client is
    /// connected but a previous authentication failed, only the authentication is retried.
    pub async fn connect(&self) -> crate::Result<()> {
        let _connecting = self.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Authenticating => {}
            ConnectionState::Disconnected | ConnectionState::Connecting => self.open().await?,
        }

        let password = self.password();
        self.authenticate_inner(&password).await?;
        Ok(())
    }

    async fn open(&self) -> crate::Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.begin(generation);

        debug!("Connecting to {}", self.config.address);
        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.address.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.state.set(generation, ConnectionState::Disconnected);
                return Err(err.into());
            }
            Err(elapsed) => {
                self.state.set(generation, ConnectionState::Disconnected);
                return Err(elapsed.into());
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", err);
        }

        let conn = Arc::new(Connection::new(
            generation,
            DispatchOptions::from(&self.config),
            self.state.clone(),
            self.listeners.clone(),
        ));

        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            previous.conn.close();
        }

        self.state.set(generation, ConnectionState::Authenticating);
        *session = Some(Session::start(stream, conn));

        Ok(())
    }

    /// Authenticates the current connection with `password`, remembering it for reconnects.
    ///
    /// On [`AuthError::InvalidPassword`] the connection stays open and this can be called again
    /// with another password.
    pub async fn authenticate(&self, password: &str) -> Result<(), AuthError> {
        self.set_password(password);
        self.authenticate_inner(password).await
    }

    async fn authenticate_inner(&self, password: &str) -> Result<(), AuthError> {
        let timeout = self.config.command_timeout;

        let (conn, reply) = {
            let mut session = self.session.lock().await;
            let session = session
                .as_mut()
                .filter(|session| !session.conn.is_closed())
                .ok_or_else(|| AuthError::Fatal(ErrorKind::NotConnected.into()))?;

            let reply = session.conn.begin_auth();
            let packet = Packet::new(AUTH_PACKET_ID, PacketType::Auth, password);
            if let Err(err) = session.send(&[packet], timeout).await {
                session.conn.cancel_auth();
                return Err(AuthError::Fatal(err));
            }

            (session.conn.clone(), reply)
        };

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(true)) => {
                info!("Authenticated with {}", self.config.address);
                self.state.set(conn.generation, ConnectionState::Ready);
                if let Some(interval) = self.config.disconnection_check_interval {
                    self.watch(&conn, interval);
                }
                Ok(())
            }
            Ok(Ok(false)) => {
                debug!("Server rejected the password");
                self.state.set(conn.generation, ConnectionState::Authenticating);
                Err(AuthError::InvalidPassword)
            }
            Ok(Err(_)) => Err(AuthError::Fatal(ErrorKind::ConnectionClosed.into())),
            Err(elapsed) => {
                conn.cancel_auth();
                Err(AuthError::Fatal(elapsed.into()))
            }
        }
    }

    /// Sends a command and waits for its response, using the configured command timeout.
    pub async fn send_command(&self, command: &str) -> crate::Result<String> {
        self.send_command_with_timeout(command, self.config.command_timeout).await
    }

    /// Sends a command and waits at most `timeout` for its response.
    pub async fn send_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> crate::Result<String> {
        self.send_command_with(command, self.config.multi_packet, timeout).await
    }

    /// Sends a command, choosing for this call alone whether its response may span several
    /// packets, and waits at most `timeout` for it.
    pub async fn send_command_with(
        &self,
        command: &str,
        multi_packet: bool,
        timeout: Duration,
    ) -> crate::Result<String> {
        if command.trim().is_empty() {
            return Err(ErrorKind::EmptyCommand.into());
        }

        if self.config.auto_connect && self.state() != ConnectionState::Ready {
            self.connect().await?;
        }

        let (conn, id, response) = {
            let mut session = self.session.lock().await;
            let session = match session.as_mut() {
                Some(session) if !session.conn.is_closed() && self.is_authenticated() => session,
                _ => return Err(ErrorKind::NotConnected.into()),
            };

            let id = self.next_packet_id();
            let response = session.conn.requests.register(id, multi_packet);

            let mut packets = vec![Packet::new(id, PacketType::ExecCommand, command)];
            if multi_packet {
                // The server answers this one after the full response to the command
                packets.push(Packet::new(id, PacketType::Response, ""));
            }

            if let Err(err) = session.send(&packets, timeout).await {
                session.conn.requests.remove(id);
                return Err(err);
            }

            (session.conn.clone(), id, response)
        };

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result.map(|mut body| {
                let trimmed_len = body.trim_end().len();
                body.truncate(trimmed_len);
                body
            }),
            Ok(Err(_)) => Err(ErrorKind::ConnectionClosed.into()),
            Err(elapsed) => {
                conn.requests.remove(id);
                Err(elapsed.into())
            }
        }
    }

    /// Sends a command and parses its response with `parser`.
    pub async fn send_command_parsed<P: Parser>(
        &self,
        command: &str,
        parser: &P,
    ) -> crate::Result<P::Output> {
        let response = self.send_command(command).await?;
        parser
            .try_parse(&response)
            .ok_or_else(|| ErrorKind::Parse.into())
    }

    /// Closes the connection. Commands still waiting for a response fail with
    /// [`ErrorKind::ConnectionClosed`].
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            debug!("Disconnecting from {}", self.config.address);
            session.shutdown().await;
        }
    }

    fn next_packet_id(&self) -> i32 {
        next_packet_id(&self.next_id)
    }

    /// Starts the disconnection check of `conn`, once per connection.
    fn watch(&self, conn: &Arc<Connection>, interval: Duration) {
        if !conn.claim_watch() {
            return;
        }

        let task = tokio::spawn(watch_connection(
            Arc::downgrade(&self.session),
            conn.clone(),
            self.next_id.clone(),
            interval,
            self.config.command_timeout,
        ));
        conn.track(task.abort_handle());
    }
}

fn next_packet_id(next_id: &AtomicI32) -> i32 {
    // 0 and -1 have special meanings, so wrap around to 1
    let (Ok(id) | Err(id)) = next_id.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
        Some(if id == i32::MAX { 1 } else { id + 1 })
    });
    id
}

/// Sends [`DISCONNECTION_CHECK_COMMAND`] every `interval` until the connection closes, and closes
/// it when a check goes unanswered.
async fn watch_connection(
    session: Weak<SharedSession>,
    conn: Arc<Connection>,
    next_id: Arc<AtomicI32>,
    interval: Duration,
    timeout: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;

        let (id, response) = {
            // The session is gone once the client is dropped
            let Some(shared) = session.upgrade() else {
                return;
            };
            let mut guard = shared.lock().await;
            let current = match guard.as_mut() {
                Some(current) if Arc::ptr_eq(&current.conn, &conn) && !conn.is_closed() => current,
                _ => return,
            };

            let id = next_packet_id(&next_id);
            let response = conn.requests.register(id, false);
            let packet = Packet::new(id, PacketType::ExecCommand, DISCONNECTION_CHECK_COMMAND);
            if current.send(&[packet], timeout).await.is_err() {
                // A failed write has closed the connection already
                return;
            }

            (id, response)
        };

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(Ok(_))) => trace!("Connection check {} answered", id),
            Ok(_) => return,
            Err(_) => {
                warn!("Connection check went unanswered for {:?}, closing connection", timeout);
                conn.requests.remove(id);
                conn.close();
                return;
            }
        }
    }
}
