use super::{ByteReader, QuerySocket};
use log::debug;

const SIMPLE_HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const SPLIT_HEADER: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];

const A2S_INFO: u8 = 0x54;
const A2S_PLAYER: u8 = 0x55;
const S2A_INFO: u8 = 0x49;
const S2A_PLAYER: u8 = 0x44;
const S2C_CHALLENGE: u8 = 0x41;

const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";
const NO_CHALLENGE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

// Servers hand out a fresh challenge per request, so only retry a couple of times
const MAX_CHALLENGES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Dedicated,
    NonDedicated,
    SourceTv,
    Unknown(u8),
}

impl From<u8> for ServerType {
    fn from(val: u8) -> Self {
        match val {
            b'd' => ServerType::Dedicated,
            b'l' => ServerType::NonDedicated,
            b'p' => ServerType::SourceTv,
            other => ServerType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEnvironment {
    Linux,
    Windows,
    Mac,
    Unknown(u8),
}

impl From<u8> for ServerEnvironment {
    fn from(val: u8) -> Self {
        match val {
            b'l' => ServerEnvironment::Linux,
            b'w' => ServerEnvironment::Windows,
            b'm' | b'o' => ServerEnvironment::Mac,
            other => ServerEnvironment::Unknown(other),
        }
    }
}

/// Reply to an A2S_INFO query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub protocol: u8,
    pub name: String,
    pub map: String,
    pub folder: String,
    pub game: String,
    pub app_id: i16,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
    pub server_type: ServerType,
    pub environment: ServerEnvironment,
    /// Whether the server requires a password.
    pub private: bool,
    pub vac_secured: bool,
}

/// One entry of an A2S_PLAYER reply.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePlayer {
    pub index: u8,
    pub name: String,
    pub score: i32,
    /// Seconds the player has been connected.
    pub duration: f32,
}

enum Reply<'a> {
    Challenge([u8; 4]),
    Payload(u8, &'a [u8]),
}

fn parse_reply(datagram: &[u8]) -> crate::Result<Reply<'_>> {
    let mut reader = ByteReader::new(datagram);
    let header: [u8; 4] = reader.array()?;
    if header == SPLIT_HEADER {
        return Err(crate::Error::malformed(
            "split replies spanning several datagrams are not supported",
        ));
    }
    if header != SIMPLE_HEADER {
        return Err(crate::Error::malformed(format!(
            "unexpected reply header {:02X?}",
            header
        )));
    }

    let kind = reader.u8()?;
    if kind == S2C_CHALLENGE {
        return Ok(Reply::Challenge(reader.array()?));
    }
    Ok(Reply::Payload(kind, &datagram[5..]))
}

pub(crate) fn info_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut request = Vec::with_capacity(SIMPLE_HEADER.len() + 1 + INFO_PAYLOAD.len() + 4);
    request.extend_from_slice(&SIMPLE_HEADER);
    request.push(A2S_INFO);
    request.extend_from_slice(INFO_PAYLOAD);
    if let Some(challenge) = challenge {
        request.extend_from_slice(&challenge);
    }
    request
}

pub(crate) fn player_request(challenge: [u8; 4]) -> Vec<u8> {
    let mut request = Vec::with_capacity(SIMPLE_HEADER.len() + 5);
    request.extend_from_slice(&SIMPLE_HEADER);
    request.push(A2S_PLAYER);
    request.extend_from_slice(&challenge);
    request
}

/// Parses the body of an S2A_INFO reply, after the kind byte.
pub(crate) fn parse_info(payload: &[u8]) -> crate::Result<SourceInfo> {
    let mut reader = ByteReader::new(payload);
    Ok(SourceInfo {
        protocol: reader.u8()?,
        name: reader.c_string()?,
        map: reader.c_string()?,
        folder: reader.c_string()?,
        game: reader.c_string()?,
        app_id: reader.i16_le()?,
        players: reader.u8()?,
        max_players: reader.u8()?,
        bots: reader.u8()?,
        server_type: reader.u8()?.into(),
        environment: reader.u8()?.into(),
        private: reader.u8()? != 0,
        vac_secured: reader.u8()? != 0,
    })
}

/// Parses the body of an S2A_PLAYER reply, after the kind byte.
pub(crate) fn parse_players(payload: &[u8]) -> crate::Result<Vec<SourcePlayer>> {
    let mut reader = ByteReader::new(payload);
    let count = reader.u8()?;

    let mut players = Vec::with_capacity(count as usize);
    for _ in 0..count {
        players.push(SourcePlayer {
            index: reader.u8()?,
            name: reader.c_string()?,
            score: reader.i32_le()?,
            duration: reader.f32_le()?,
        });
    }
    Ok(players)
}

fn unexpected(kind: u8, expected: u8) -> crate::Error {
    crate::Error::malformed(format!(
        "expected reply type 0x{:02X}, got 0x{:02X}",
        expected, kind
    ))
}

pub(crate) async fn info(socket: &mut QuerySocket) -> crate::Result<SourceInfo> {
    let mut challenge = None;

    for _ in 0..=MAX_CHALLENGES {
        socket.send(&info_request(challenge)).await?;

        match parse_reply(socket.recv().await?)? {
            Reply::Payload(S2A_INFO, payload) => return parse_info(payload),
            Reply::Payload(kind, _) => return Err(unexpected(kind, S2A_INFO)),
            Reply::Challenge(token) => {
                debug!("Server requested challenge {:02X?} for info query", token);
                challenge = Some(token);
            }
        }
    }

    Err(crate::Error::malformed("server kept answering with new challenges"))
}

pub(crate) async fn players(socket: &mut QuerySocket) -> crate::Result<Vec<SourcePlayer>> {
    let mut challenge = NO_CHALLENGE;

    for _ in 0..=MAX_CHALLENGES {
        socket.send(&player_request(challenge)).await?;

        match parse_reply(socket.recv().await?)? {
            Reply::Payload(S2A_PLAYER, payload) => return parse_players(payload),
            Reply::Payload(kind, _) => return Err(unexpected(kind, S2A_PLAYER)),
            Reply::Challenge(token) => {
                debug!("Server requested challenge {:02X?} for player query", token);
                challenge = token;
            }
        }
    }

    Err(crate::Error::malformed("server kept answering with new challenges"))
}
