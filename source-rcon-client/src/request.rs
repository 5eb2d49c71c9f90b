use crate::config::{Terminator, SOURCE_TERMINATOR_BODY};
use crate::ErrorKind;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Id servers that don't echo request ids answer with.
pub(crate) const UNMATCHED_ID: i32 = 0;

pub(crate) type ResponseSlot = oneshot::Sender<crate::Result<String>>;

/// A command waiting for its response.
#[derive(Debug)]
struct PendingRequest {
    slot: ResponseSlot,
    body: String,
    expects_multi_packet: bool,
}

/// What happened to a packet handed to [`RequestTable::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The request with this id received its full response.
    Completed(i32),
    /// The body was added to the request's partial response.
    Buffered(i32),
    /// No pending request matches the packet.
    Unmatched,
    /// A trailing Source terminator marker, which is never part of a response.
    Discarded,
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<i32, PendingRequest>,
    // Registration order, oldest first. May contain ids that were already removed.
    order: VecDeque<i32>,
}

/// Pending commands keyed by packet id.
#[derive(Debug, Default)]
pub(crate) struct RequestTable {
    inner: Mutex<Inner>,
}

impl RequestTable {
    pub fn new() -> Self {
        RequestTable::default()
    }

    /// Registers a request and returns the receiving end of its response slot.
    ///
    /// An existing request with the same id is failed with [`ErrorKind::ConnectionClosed`]
    /// rather than silently overwritten.
    pub fn register(
        &self,
        id: i32,
        expects_multi_packet: bool,
    ) -> oneshot::Receiver<crate::Result<String>> {
        let (slot, receiver) = oneshot::channel();
        let mut inner = self.lock();

        let previous = inner.pending.insert(
            id,
            PendingRequest {
                slot,
                body: String::new(),
                expects_multi_packet,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.slot.send(Err(ErrorKind::ConnectionClosed.into()));
        }
        inner.order.push_back(id);

        receiver
    }

    /// Removes a request without completing it, e.g. after it timed out.
    pub fn remove(&self, id: i32) -> bool {
        let mut inner = self.lock();
        let removed = inner.pending.remove(&id).is_some();
        inner.order.retain(|&queued| queued != id);
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Routes a response body to the request it belongs to.
    pub fn deliver(
        &self,
        id: i32,
        body: &str,
        strict_id_matching: bool,
        terminator: &Terminator,
    ) -> Delivery {
        // Servers that don't echo ids send the marker with id 0, which would otherwise land in the
        // next pending command
        if *terminator == Terminator::EmptyEcho && body == SOURCE_TERMINATOR_BODY {
            return Delivery::Discarded;
        }

        let mut inner = self.lock();

        let id = if inner.pending.contains_key(&id) {
            id
        } else if !strict_id_matching && id == UNMATCHED_ID {
            match inner.oldest() {
                Some(oldest) => oldest,
                None => return Delivery::Unmatched,
            }
        } else {
            return Delivery::Unmatched;
        };

        let Some(request) = inner.pending.get_mut(&id) else {
            return Delivery::Unmatched;
        };

        if request.expects_multi_packet {
            let is_terminator = match terminator {
                Terminator::EmptyEcho => body.is_empty(),
                Terminator::Body(marker) => body == marker,
            };
            if !is_terminator {
                request.body.push_str(body);
                return Delivery::Buffered(id);
            }
        } else {
            request.body.push_str(body);
        }

        let request = inner.take(id);
        if let Some(request) = request {
            let _ = request.slot.send(Ok(request.body));
        }
        Delivery::Completed(id)
    }

    /// Fails every pending request with `kind()`.
    pub fn fail_all(&self, kind: impl Fn() -> ErrorKind) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.lock();
            inner.order.clear();
            inner.pending.drain().map(|(_, request)| request).collect()
        };

        let count = drained.len();
        for request in drained {
            let _ = request.slot.send(Err(kind().into()));
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock can't leave the map half-updated, so keep going.
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Inner {
    fn oldest(&mut self) -> Option<i32> {
        while let Some(&id) = self.order.front() {
            if self.pending.contains_key(&id) {
                return Some(id);
            }
            self.order.pop_front();
        }
        None
    }

    fn take(&mut self, id: i32) -> Option<PendingRequest> {
        let request = self.pending.remove(&id);
        if self.order.front() == Some(&id) {
            self.order.pop_front();
        } else {
            self.order.retain(|&queued| queued != id);
        }
        request
    }
}
