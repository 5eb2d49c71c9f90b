//! Stateless UDP server queries.
//!
//! Two server families are supported: the Source engine's A2S queries and the Minecraft query
//! protocol. Every call opens its own socket, so queries can run concurrently without sharing
//! anything.
//!
//! # Example
//! ```rust,no_run
//! use source_rcon_client::query::{self, QueryFamily, QueryInfo};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let info = query::info("localhost:27015", QueryFamily::Source, Duration::from_secs(2))
//!         .await
//!         .unwrap();
//!
//!     if let QueryInfo::Source(info) = info {
//!         println!("{} on {} ({}/{})", info.name, info.map, info.players, info.max_players);
//!     }
//! }
//! ```

mod minecraft;
mod source;

pub use self::minecraft::MinecraftInfo;
pub use self::source::{ServerEnvironment, ServerType, SourceInfo, SourcePlayer};

use crate::ErrorKind;
use log::trace;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;

// Large enough for any unsplit reply of either family
const MAX_DATAGRAM_LEN: usize = 8192;

/// The query protocol a server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFamily {
    Source,
    Minecraft,
}

impl FromStr for QueryFamily {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "source" | "a2s" => Ok(QueryFamily::Source),
            "minecraft" | "mc" => Ok(QueryFamily::Minecraft),
            _ => Err(ErrorKind::UnknownQueryFamily(s.to_string()).into()),
        }
    }
}

impl fmt::Display for QueryFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryFamily::Source => write!(f, "source"),
            QueryFamily::Minecraft => write!(f, "minecraft"),
        }
    }
}

/// Server information returned by [`info`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInfo {
    Source(SourceInfo),
    Minecraft(MinecraftInfo),
}

/// Queries general information about a server.
///
/// Each receive waits at most `timeout`.
pub async fn info(
    address: &str,
    family: QueryFamily,
    timeout: Duration,
) -> crate::Result<QueryInfo> {
    let mut socket = QuerySocket::connect(address, timeout).await?;
    match family {
        QueryFamily::Source => source::info(&mut socket).await.map(QueryInfo::Source),
        QueryFamily::Minecraft => minecraft::info(&mut socket).await.map(QueryInfo::Minecraft),
    }
}

/// Queries the players on a Source engine server.
///
/// Each receive waits at most `timeout`.
pub async fn players(address: &str, timeout: Duration) -> crate::Result<Vec<SourcePlayer>> {
    let mut socket = QuerySocket::connect(address, timeout).await?;
    source::players(&mut socket).await
}

/// A UDP socket connected to a single server, with a bounded wait on every receive.
pub(crate) struct QuerySocket {
    socket: UdpSocket,
    timeout: Duration,
    buffer: Vec<u8>,
}

impl QuerySocket {
    async fn connect(address: &str, timeout: Duration) -> crate::Result<Self> {
        let remote = tokio::time::timeout(timeout, tokio::net::lookup_host(address))
            .await??
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} did not resolve to an address", address),
                )
            })?;

        let local: SocketAddr = if remote.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(local).await?;

        // Connecting filters out datagrams from anyone but the server
        socket.connect(remote).await?;

        Ok(QuerySocket {
            socket,
            timeout,
            buffer: vec![0; MAX_DATAGRAM_LEN],
        })
    }

    async fn send(&self, datagram: &[u8]) -> crate::Result<()> {
        trace!("Sending {} byte query", datagram.len());
        self.socket.send(datagram).await?;
        Ok(())
    }

    async fn recv(&mut self) -> crate::Result<&[u8]> {
        let len = tokio::time::timeout(self.timeout, self.socket.recv(&mut self.buffer)).await??;
        trace!("Received {} byte query reply", len);
        Ok(&self.buffer[..len])
    }
}

/// Sequential reader over a reply datagram. Every read fails with
/// [`ErrorKind::MalformedPacket`] instead of running past the end.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn bytes(&mut self, len: usize) -> crate::Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(crate::Error::malformed(format!(
                "reply ended after {} bytes, expected at least {}",
                self.buf.len(),
                self.pos + len
            )));
        }

        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> crate::Result<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> crate::Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn array<const N: usize>(&mut self) -> crate::Result<[u8; N]> {
        let mut array = [0; N];
        array.copy_from_slice(self.bytes(N)?);
        Ok(array)
    }

    pub fn i16_le(&mut self) -> crate::Result<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn i32_le(&mut self) -> crate::Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn f32_le(&mut self) -> crate::Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    /// Reads a NUL terminated string, replacing invalid UTF-8.
    pub fn c_string(&mut self) -> crate::Result<String> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| crate::Error::malformed("unterminated string in reply"))?;

        let string = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_family_names() {
        assert_eq!("source".parse::<QueryFamily>().unwrap(), QueryFamily::Source);
        assert_eq!("Minecraft".parse::<QueryFamily>().unwrap(), QueryFamily::Minecraft);

        let err = "quake".parse::<QueryFamily>().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnknownQueryFamily(name) if name == "quake"));
    }

    #[test]
    fn byte_reader_never_reads_past_the_end() {
        let mut reader = ByteReader::new(b"ab\0\x01\x00\x02");
        assert_eq!(reader.c_string().unwrap(), "ab");
        assert_eq!(reader.i16_le().unwrap(), 1);
        assert_eq!(reader.u8().unwrap(), 2);
        assert!(reader.is_empty());

        assert!(matches!(reader.u8().unwrap_err().kind(), ErrorKind::MalformedPacket(_)));
        assert!(matches!(reader.c_string().unwrap_err().kind(), ErrorKind::MalformedPacket(_)));

        let mut reader = ByteReader::new(b"no terminator");
        assert!(reader.c_string().is_err());
    }
}
