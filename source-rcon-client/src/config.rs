use crate::packet::{Encoding, DEFAULT_MAX_PACKET_SIZE};
use std::time::Duration;

/// Body the Source engine sends after mirroring the empty packet that follows a command in
/// multi-packet mode.
pub const SOURCE_TERMINATOR_BODY: &str = "\u{0}\u{1}\u{0}\u{0}";

/// How the end of a multi-packet response is recognised.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Terminator {
    /// The server mirrors the empty packet sent after each command; the first empty body ends
    /// the response.
    #[default]
    EmptyEcho,

    /// A packet with exactly this body ends the response. Empty bodies are skipped.
    Body(String),
}

/// Options for an [`RconClient`](crate::RconClient).
#[derive(Debug, Clone)]
pub struct RconConfig {
    /// Server address, e.g. `127.0.0.1:27015` or `play.example.com:25575`.
    pub address: String,
    pub password: String,
    /// Time allowed for the TCP connection to be established.
    pub connect_timeout: Duration,
    /// Default time to wait for a write, an authentication reply or a command response.
    pub command_timeout: Duration,
    /// Follow every command with an empty packet and reassemble responses split across several
    /// packets until its echo arrives.
    pub multi_packet: bool,
    pub terminator: Terminator,
    /// Only match responses by packet id. When disabled, responses with id 0 are handed to the
    /// oldest pending command, for servers that don't echo ids.
    pub strict_id_matching: bool,
    /// Connect and authenticate transparently when a command is sent while not connected.
    pub auto_connect: bool,
    pub encoding: Encoding,
    /// Upper bound for the size field of a packet, in either direction.
    pub max_packet_size: usize,
    /// Send a comment command this often once authenticated and close the connection when one
    /// goes unanswered for the command timeout.
    pub disconnection_check_interval: Option<Duration>,
}

impl RconConfig {
    pub fn new(address: impl Into<String>, password: impl Into<String>) -> Self {
        RconConfig {
            address: address.into(),
            password: password.into(),
            ..RconConfig::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_multi_packet(mut self, enabled: bool) -> Self {
        self.multi_packet = enabled;
        self
    }

    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn with_strict_id_matching(mut self, enabled: bool) -> Self {
        self.strict_id_matching = enabled;
        self
    }

    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_disconnection_check_interval(mut self, interval: Duration) -> Self {
        self.disconnection_check_interval = Some(interval);
        self
    }
}

impl Default for RconConfig {
    fn default() -> Self {
        RconConfig {
            address: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            multi_packet: false,
            terminator: Terminator::default(),
            strict_id_matching: true,
            auto_connect: false,
            encoding: Encoding::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            disconnection_check_interval: None,
        }
    }
}
