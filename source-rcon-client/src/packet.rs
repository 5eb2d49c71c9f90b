use log::warn;
use std::mem::size_of;

/// Packet id used for authentication requests.
pub const AUTH_PACKET_ID: i32 = 0;

/// Id the server answers an authentication request with when the password is wrong.
pub const AUTH_FAILED_ID: i32 = -1;

/// Smallest legal value of the size field: id, type and the two terminators.
pub const MIN_PACKET_SIZE: usize = 2 * size_of::<i32>() + 2;

/// Default upper bound for the size field.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4200;

const SIZE_FIELD_LEN: usize = size_of::<i32>();
const HEADER_LEN: usize = 3 * size_of::<i32>();

/// The `type` field of a packet.
///
/// `SERVERDATA_AUTH_RESPONSE` and `SERVERDATA_EXECCOMMAND` share the wire value 2. Inbound packets
/// with that value decode as [`PacketType::AuthResponse`] since servers never send commands, and
/// [`PacketType::ExecCommand`] encodes to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// `SERVERDATA_RESPONSE_VALUE`
    Response,
    /// `SERVERDATA_EXECCOMMAND`
    ExecCommand,
    /// `SERVERDATA_AUTH_RESPONSE`
    AuthResponse,
    /// `SERVERDATA_AUTH`
    Auth,
    Unknown(i32),
}

impl PacketType {
    pub fn to_wire(self) -> i32 {
        match self {
            PacketType::Response => 0,
            PacketType::ExecCommand | PacketType::AuthResponse => 2,
            PacketType::Auth => 3,
            PacketType::Unknown(val) => val,
        }
    }

    pub fn from_wire(val: i32) -> Self {
        match val {
            0 => PacketType::Response,
            2 => PacketType::AuthResponse,
            3 => PacketType::Auth,
            other => PacketType::Unknown(other),
        }
    }
}

/// Text encoding used for packet bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// 7-bit ASCII. Characters outside the range are sent as `?`.
    Ascii,
    /// ISO-8859-1. Characters above U+00FF are sent as `?`.
    Latin1,
}

impl Encoding {
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String, String> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|err| err.to_string()),
            Encoding::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(pos) => Err(format!("non-ASCII byte at offset {}", pos)),
                None => Ok(bytes.iter().map(|&b| b as char).collect()),
            },
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// A single RCON packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub packet_type: PacketType,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, packet_type: PacketType, body: impl Into<String>) -> Self {
        Packet {
            id,
            packet_type,
            body: body.into(),
        }
    }

    /// Serializes the packet, failing if the size field would exceed `max_size`.
    pub fn encode(&self, encoding: Encoding, max_size: usize) -> crate::Result<Vec<u8>> {
        let body = encoding.encode(&self.body);
        let size = MIN_PACKET_SIZE + body.len();
        if size > max_size {
            return Err(crate::ErrorKind::PacketTooLarge {
                size,
                max: max_size,
            }
            .into());
        }

        let mut buf = Vec::with_capacity(SIZE_FIELD_LEN + size);

        // Insert a placeholder for the packet size
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.packet_type.to_wire().to_le_bytes());
        buf.extend_from_slice(&body);

        // Terminators for the body and the packet
        buf.extend_from_slice(&[0, 0]);

        // The size field doesn't count itself
        let size_bytes = ((buf.len() - SIZE_FIELD_LEN) as i32).to_le_bytes();
        buf[..SIZE_FIELD_LEN].copy_from_slice(&size_bytes);

        Ok(buf)
    }

    /// Parses a packet from a buffer starting with its size field.
    ///
    /// A body that isn't valid in `encoding` is replaced by an empty string, so one bad packet
    /// doesn't take down the stream it arrived on.
    pub fn decode(buf: &[u8], encoding: Encoding) -> crate::Result<Packet> {
        if buf.len() < SIZE_FIELD_LEN {
            return Err(crate::Error::malformed("buffer does not contain a size field"));
        }

        let size = read_i32_le(buf, 0);
        if size < 0 || size as usize > buf.len() - SIZE_FIELD_LEN {
            return Err(crate::Error::malformed(format!(
                "declared size {} does not fit in a buffer of {} bytes",
                size,
                buf.len()
            )));
        }
        let size = size as usize;
        if size < MIN_PACKET_SIZE {
            return Err(crate::Error::malformed(format!(
                "declared size {} is below the minimum of {}",
                size, MIN_PACKET_SIZE
            )));
        }

        let id = read_i32_le(buf, 4);
        let packet_type = PacketType::from_wire(read_i32_le(buf, 8));
        let body_bytes = &buf[HEADER_LEN..SIZE_FIELD_LEN + size - 2];

        let body = match encoding.decode(body_bytes) {
            Ok(body) => body,
            Err(err) => {
                warn!("Discarding undecodable body of packet {}: {}", id, err);
                String::new()
            }
        };

        Ok(Packet {
            id,
            packet_type,
            body,
        })
    }
}

pub(crate) fn read_i32_le(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn round_trip(packet: &Packet, encoding: Encoding) -> Packet {
        let bytes = packet.encode(encoding, DEFAULT_MAX_PACKET_SIZE).unwrap();
        Packet::decode(&bytes, encoding).unwrap()
    }

    #[test]
    fn encode_layout() {
        let bytes = Packet::new(7, PacketType::ExecCommand, "status")
            .encode(Encoding::Utf8, DEFAULT_MAX_PACKET_SIZE)
            .unwrap();

        assert_eq!(&bytes[0..4], &16i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2i32.to_le_bytes());
        assert_eq!(&bytes[12..18], b"status");
        assert_eq!(&bytes[18..], &[0, 0]);
    }

    #[test]
    fn round_trips() {
        let packets = [
            Packet::new(1, PacketType::Response, ""),
            Packet::new(-1, PacketType::AuthResponse, ""),
            Packet::new(i32::MAX, PacketType::Auth, "hunter2"),
            Packet::new(42, PacketType::Response, "say éĺäö 日本語"),
            Packet::new(3, PacketType::Unknown(99), "x".repeat(1000)),
        ];

        for packet in &packets {
            assert_eq!(&round_trip(packet, Encoding::Utf8), packet);
        }
    }

    #[test]
    fn exec_command_decodes_as_auth_response() {
        let decoded = round_trip(&Packet::new(5, PacketType::ExecCommand, "x"), Encoding::Utf8);
        assert_eq!(decoded.packet_type, PacketType::AuthResponse);
    }

    #[test]
    fn legacy_encodings() {
        let ascii = Packet::new(1, PacketType::Response, "say héllo")
            .encode(Encoding::Ascii, DEFAULT_MAX_PACKET_SIZE)
            .unwrap();
        assert_eq!(&ascii[12..ascii.len() - 2], b"say h?llo");

        let latin1 = Packet::new(1, PacketType::Response, "é€")
            .encode(Encoding::Latin1, DEFAULT_MAX_PACKET_SIZE)
            .unwrap();
        assert_eq!(&latin1[12..latin1.len() - 2], &[0xE9, b'?']);
        assert_eq!(Packet::decode(&latin1, Encoding::Latin1).unwrap().body, "é?");
    }

    #[test]
    fn invalid_body_degrades_to_empty() {
        let mut bytes = Packet::new(9, PacketType::Response, "ab")
            .encode(Encoding::Utf8, DEFAULT_MAX_PACKET_SIZE)
            .unwrap();
        bytes[12] = 0xFF;

        let packet = Packet::decode(&bytes, Encoding::Utf8).unwrap();
        assert_eq!(packet.id, 9);
        assert_eq!(packet.body, "");

        let packet = Packet::decode(&bytes, Encoding::Ascii).unwrap();
        assert_eq!(packet.body, "");
    }

    #[test]
    fn rejects_missing_size_field() {
        let err = Packet::decode(&[1, 0, 0], Encoding::Utf8).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MalformedPacket(_)));
    }

    #[test]
    fn rejects_size_larger_than_buffer() {
        let mut bytes = Packet::new(1, PacketType::Response, "abc")
            .encode(Encoding::Utf8, DEFAULT_MAX_PACKET_SIZE)
            .unwrap();
        bytes.truncate(bytes.len() - 1);

        let err = Packet::decode(&bytes, Encoding::Utf8).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MalformedPacket(_)));
    }

    #[test]
    fn rejects_size_below_minimum() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&9i32.to_le_bytes());
        bytes.extend_from_slice(&[0; 9]);

        let err = Packet::decode(&bytes, Encoding::Utf8).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MalformedPacket(_)));

        // The decoder keeps no state, so the next buffer is unaffected
        let valid = Packet::new(2, PacketType::Response, "ok")
            .encode(Encoding::Utf8, DEFAULT_MAX_PACKET_SIZE)
            .unwrap();
        assert_eq!(Packet::decode(&valid, Encoding::Utf8).unwrap().body, "ok");
    }

    #[test]
    fn rejects_oversized_body() {
        let err = Packet::new(1, PacketType::ExecCommand, "x".repeat(100))
            .encode(Encoding::Utf8, 64)
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::PacketTooLarge { size: 110, max: 64 }
        ));
    }
}
