//! This crate provides an asynchronous client for the [Source RCON protocol], the remote console
//! used by Source engine servers and by many other games that copied its wire format (Minecraft,
//! Rust, ARK, Factorio, ...), along with the companion UDP [server query] protocols.
//!
//! The client is entirely asynchronous and requires a [Tokio](https://tokio.rs/) runtime.
//!
//! Create an [`RconClient`] from an [`RconConfig`], then either call [`RconClient::connect`] or
//! enable auto-connect and just start sending commands. Commands can be sent concurrently from
//! several tasks; responses are matched back to their caller by packet id.
//!
//! # Example
//! ```rust,no_run
//! use source_rcon_client::{RconClient, RconConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = RconClient::new(
//!         RconConfig::new("localhost:27015", "password123").with_multi_packet(true),
//!     );
//!
//!     client.connect().await.unwrap();
//!
//!     let response = client.send_command("cvarlist").await.unwrap();
//!     println!("{}", response);
//! }
//! ```
//!
//! [Source RCON protocol]: https://developer.valvesoftware.com/wiki/Source_RCON_Protocol
//! [server query]: https://developer.valvesoftware.com/wiki/Server_queries

mod client;
mod config;
mod events;
mod frame;
mod inner_client;
mod packet;
mod request;

#[cfg(feature = "query")]
pub mod query;

pub use self::client::*;
pub use self::config::*;
pub use self::events::{parser_fn, FnParser, Parser};
pub use self::frame::{split_frame, FrameReader};
pub use self::packet::*;

/// Error type for RCON and query operations.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error(ErrorKind);

/// The different failures an operation can end with.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("packet of {size} bytes exceeds the maximum of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },

    #[error("authentication failed: invalid password")]
    AuthenticationFailed,

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("command must not be empty")]
    EmptyCommand,

    #[error("unknown query server family `{0}`")]
    UnknownQueryFamily(String),

    #[error("failed to parse server response")]
    Parse,
}

/// [`Result`] alias for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<T> for Error
where
    T: Into<ErrorKind>,
{
    fn from(inner: T) -> Self {
        Error(inner.into())
    }
}

impl From<tokio::time::error::Elapsed> for ErrorKind {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ErrorKind::Timeout
    }
}

impl Error {
    /// The kind of failure this error represents.
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Consumes the error, returning its kind.
    pub fn into_kind(self) -> ErrorKind {
        self.0
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.0, ErrorKind::Timeout)
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self.0, ErrorKind::ConnectionClosed)
    }

    pub fn is_auth_failed(&self) -> bool {
        matches!(self.0, ErrorKind::AuthenticationFailed)
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error(ErrorKind::MalformedPacket(msg.into()))
    }
}

/// Connect to an RCON server and authenticate with the password from `config`.
///
/// This is a shorthand for [`RconClient::new`] followed by [`RconClient::connect`].
///
/// # Example
/// ```rust,no_run
/// use source_rcon_client::{connect, RconConfig};
///
/// #[tokio::main]
/// async fn main() {
///     match connect(RconConfig::new("localhost:27015", "password123")).await {
///         Ok(client) => println!("{}", client.send_command("status").await.unwrap()),
///         Err(err) if err.is_auth_failed() => panic!("Wrong password"),
///         Err(err) => panic!("Connection failed: {}", err),
///     }
/// }
/// ```
pub async fn connect(config: RconConfig) -> Result<RconClient> {
    let client = RconClient::new(config);
    client.connect().await?;
    Ok(client)
}
