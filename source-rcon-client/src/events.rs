//! Listener registry fed by the dispatcher.
//!
//! Listeners are called synchronously from the task that reads the connection, so they must
//! return quickly. Anything slow should be handed off through a channel. They are called on a
//! snapshot of the registry, so a listener may register further listeners.

use crate::packet::Packet;
use std::sync::{Arc, Mutex, RwLock};

/// Turns a line of server output into a typed value.
pub trait Parser: Send + Sync {
    type Output;

    fn is_match(&self, input: &str) -> bool;

    fn parse(&self, input: &str) -> Option<Self::Output>;

    /// Parses `input` only if it matches.
    fn try_parse(&self, input: &str) -> Option<Self::Output> {
        if self.is_match(input) {
            self.parse(input)
        } else {
            None
        }
    }
}

/// A [`Parser`] made of a matcher closure and a parse closure.
pub struct FnParser<M, P> {
    matcher: M,
    parse: P,
}

/// Builds a [`Parser`] from a matcher and a parse function.
///
/// # Example
/// ```rust
/// use source_rcon_client::{parser_fn, Parser};
///
/// let hostname = parser_fn(
///     |line| line.starts_with("hostname: "),
///     |line| line.strip_prefix("hostname: ").map(|name| name.trim().to_string()),
/// );
///
/// assert_eq!(hostname.try_parse("hostname: My Server\n").as_deref(), Some("My Server"));
/// assert_eq!(hostname.try_parse("map: de_dust2"), None);
/// ```
pub fn parser_fn<M, P, T>(matcher: M, parse: P) -> FnParser<M, P>
where
    M: Fn(&str) -> bool + Send + Sync,
    P: Fn(&str) -> Option<T> + Send + Sync,
{
    FnParser { matcher, parse }
}

impl<M, P, T> Parser for FnParser<M, P>
where
    M: Fn(&str) -> bool + Send + Sync,
    P: Fn(&str) -> Option<T> + Send + Sync,
{
    type Output = T;

    fn is_match(&self, input: &str) -> bool {
        (self.matcher)(input)
    }

    fn parse(&self, input: &str) -> Option<T> {
        (self.parse)(input)
    }
}

type DisconnectListener = Arc<dyn Fn() + Send + Sync>;
type PacketListener = Arc<dyn Fn(&Packet) + Send + Sync>;
type BodyListener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Listeners {
    disconnected: RwLock<Vec<DisconnectListener>>,
    packets: RwLock<Vec<PacketListener>>,
    // Raw body listeners and parser registrations, in registration order.
    bodies: RwLock<Vec<BodyListener>>,
    // Serializes disconnect notifications of overlapping sessions.
    notify: Mutex<()>,
}

impl Listeners {
    pub fn on_disconnected(&self, listener: DisconnectListener) {
        write(&self.disconnected).push(listener);
    }

    pub fn on_packet(&self, listener: PacketListener) {
        write(&self.packets).push(listener);
    }

    pub fn on_body(&self, listener: BodyListener) {
        write(&self.bodies).push(listener);
    }

    pub fn listen<P, C>(&self, parser: P, callback: C)
    where
        P: Parser + 'static,
        C: Fn(P::Output) + Send + Sync + 'static,
    {
        self.on_body(Arc::new(move |body| {
            if let Some(parsed) = parser.try_parse(body) {
                callback(parsed);
            }
        }));
    }

    pub fn packet_received(&self, packet: &Packet) {
        for listener in snapshot(&self.packets) {
            listener(packet);
        }

        if packet.body.is_empty() {
            return;
        }
        for listener in snapshot(&self.bodies) {
            listener(&packet.body);
        }
    }

    pub fn disconnected(&self) {
        let _guard = self.notify.lock().unwrap_or_else(|err| err.into_inner());
        for listener in snapshot(&self.disconnected) {
            listener();
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("disconnected", &read(&self.disconnected).len())
            .field("packets", &read(&self.packets).len())
            .field("bodies", &read(&self.bodies).len())
            .finish()
    }
}

fn snapshot<T: ?Sized>(lock: &RwLock<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    read(lock).clone()
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|err| err.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|err| err.into_inner())
}
