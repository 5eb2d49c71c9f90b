use super::{ByteReader, QuerySocket};
use log::debug;
use std::collections::HashMap;

const MAGIC: [u8; 2] = [0xFE, 0xFD];
const TYPE_HANDSHAKE: u8 = 0x09;
const TYPE_STAT: u8 = 0x00;

// Only the low nibble of each byte is used by servers
const SESSION_MASK: i32 = 0x0F0F_0F0F;

// Type, session id and the constant "splitnum" padding
const STAT_HEADER_LEN: usize = 16;
// Constant "\x01player_\0\0" padding before the player list
const PLAYERS_PADDING_LEN: usize = 10;

/// Reply to a Minecraft full stat query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinecraftInfo {
    pub motd: String,
    pub game_type: String,
    pub game_id: String,
    pub version: String,
    pub plugins: String,
    pub map: String,
    pub num_players: u32,
    pub max_players: u32,
    pub host_port: u16,
    pub host_ip: String,
    pub players: Vec<String>,
}

fn session_id() -> i32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default(),
    );
    (hasher.finish() as i32) & SESSION_MASK
}

pub(crate) fn handshake_request(session: i32) -> Vec<u8> {
    let mut request = Vec::with_capacity(7);
    request.extend_from_slice(&MAGIC);
    request.push(TYPE_HANDSHAKE);
    request.extend_from_slice(&session.to_be_bytes());
    request
}

pub(crate) fn full_stat_request(session: i32, token: i32) -> Vec<u8> {
    let mut request = Vec::with_capacity(15);
    request.extend_from_slice(&MAGIC);
    request.push(TYPE_STAT);
    request.extend_from_slice(&session.to_be_bytes());
    request.extend_from_slice(&token.to_be_bytes());

    // Padding that selects the full stat over the basic one
    request.extend_from_slice(&[0, 0, 0, 0]);
    request
}

fn check_header(reader: &mut ByteReader<'_>, expected_type: u8, session: i32) -> crate::Result<()> {
    let reply_type = reader.u8()?;
    if reply_type != expected_type {
        return Err(crate::Error::malformed(format!(
            "expected reply type 0x{:02X}, got 0x{:02X}",
            expected_type, reply_type
        )));
    }

    let reply_session = i32::from_be_bytes(reader.array()?);
    if reply_session != session {
        return Err(crate::Error::malformed(format!(
            "reply for session {} while waiting for {}",
            reply_session, session
        )));
    }
    Ok(())
}

/// Extracts the challenge token from a handshake reply.
pub(crate) fn parse_challenge(reply: &[u8], session: i32) -> crate::Result<i32> {
    let mut reader = ByteReader::new(reply);
    check_header(&mut reader, TYPE_HANDSHAKE, session)?;

    let token = reader.c_string()?;
    token
        .trim()
        .parse()
        .map_err(|_| crate::Error::malformed(format!("invalid challenge token {:?}", token)))
}

/// Parses a full stat reply.
pub(crate) fn parse_full_stat(reply: &[u8], session: i32) -> crate::Result<MinecraftInfo> {
    let mut reader = ByteReader::new(reply);
    check_header(&mut reader, TYPE_STAT, session)?;
    reader.skip(STAT_HEADER_LEN - 5)?;

    let mut values = HashMap::new();
    loop {
        let key = reader.c_string()?;
        if key.is_empty() {
            break;
        }
        let value = reader.c_string()?;
        values.insert(key, value);
    }

    reader.skip(PLAYERS_PADDING_LEN)?;

    let mut players = Vec::new();
    while !reader.is_empty() {
        let name = reader.c_string()?;
        if name.is_empty() {
            break;
        }
        players.push(name);
    }

    let mut take = |key: &str| {
        values
            .remove(key)
            .ok_or_else(|| crate::Error::malformed(format!("full stat reply is missing `{}`", key)))
    };

    Ok(MinecraftInfo {
        motd: take("hostname")?,
        game_type: take("gametype")?,
        game_id: take("game_id")?,
        version: take("version")?,
        plugins: take("plugins").unwrap_or_default(),
        map: take("map")?,
        num_players: parse_number(take("numplayers")?)?,
        max_players: parse_number(take("maxplayers")?)?,
        host_port: parse_number(take("hostport")?)?,
        host_ip: take("hostip")?,
        players,
    })
}

fn parse_number<T: std::str::FromStr>(value: String) -> crate::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| crate::Error::malformed(format!("expected a number, got {:?}", value)))
}

pub(crate) async fn info(socket: &mut QuerySocket) -> crate::Result<MinecraftInfo> {
    let session = session_id();

    socket.send(&handshake_request(session)).await?;
    let token = parse_challenge(socket.recv().await?, session)?;
    debug!("Received challenge token {} for session {}", token, session);

    socket.send(&full_stat_request(session, token)).await?;
    parse_full_stat(socket.recv().await?, session)
}
