#![cfg(feature = "query")]

use source_rcon_client::query::{self, QueryFamily, QueryInfo, ServerEnvironment, ServerType};
use std::time::Duration;
use tokio::net::UdpSocket;

const CHALLENGE: [u8; 4] = [0x11, 0x22, 0x33, 0x44];
const TOKEN: i32 = 9_513_307;

fn source_info_reply() -> Vec<u8> {
    let mut reply = vec![0xFF, 0xFF, 0xFF, 0xFF, 0x49, 17];
    reply.extend_from_slice(b"Test Server\0cs_office\0cstrike\0Counter-Strike: Source\0");
    reply.extend_from_slice(&240i16.to_le_bytes());
    reply.extend_from_slice(&[3, 16, 0, b'd', b'w', 1, 1]);
    reply
}

fn source_players_reply() -> Vec<u8> {
    let mut reply = vec![0xFF, 0xFF, 0xFF, 0xFF, 0x44, 2];
    for (index, name, score, duration) in [(0u8, "alice", 12i32, 61.5f32), (1, "bob", 0, 3.25)] {
        reply.push(index);
        reply.extend_from_slice(name.as_bytes());
        reply.push(0);
        reply.extend_from_slice(&score.to_le_bytes());
        reply.extend_from_slice(&duration.to_le_bytes());
    }
    reply
}

fn challenge_reply() -> Vec<u8> {
    let mut reply = vec![0xFF, 0xFF, 0xFF, 0xFF, 0x41];
    reply.extend_from_slice(&CHALLENGE);
    reply
}

/// Answers A2S queries, demanding a challenge first like current Source servers.
async fn spawn_source_server() -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let mut buf = [0u8; 1400];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let request = &buf[..len];
            let challenged = request.ends_with(&CHALLENGE);

            let reply = match request.get(4).copied() {
                Some(0x54) if challenged => source_info_reply(),
                Some(0x55) if challenged => source_players_reply(),
                Some(0x54) | Some(0x55) => challenge_reply(),
                _ => continue,
            };
            let _ = socket.send_to(&reply, from).await;
        }
    });

    address
}

async fn spawn_minecraft_server() -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let mut buf = [0u8; 1400];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let request = &buf[..len];
            if len < 7 || request[..2] != [0xFE, 0xFD] {
                continue;
            }
            let session = &request[3..7];

            let mut reply = vec![request[2]];
            reply.extend_from_slice(session);
            match request[2] {
                0x09 => {
                    reply.extend_from_slice(format!("{}\0", TOKEN).as_bytes());
                }
                0x00 if len == 15 && request[7..11] == TOKEN.to_be_bytes() => {
                    reply.extend_from_slice(b"splitnum\0\x80\0");
                    for (key, value) in [
                        ("hostname", "A Minecraft Server"),
                        ("gametype", "SMP"),
                        ("game_id", "MINECRAFT"),
                        ("version", "1.20.1"),
                        ("plugins", ""),
                        ("map", "world"),
                        ("numplayers", "1"),
                        ("maxplayers", "20"),
                        ("hostport", "25565"),
                        ("hostip", "127.0.0.1"),
                    ] {
                        reply.extend_from_slice(key.as_bytes());
                        reply.push(0);
                        reply.extend_from_slice(value.as_bytes());
                        reply.push(0);
                    }
                    reply.push(0);
                    reply.extend_from_slice(b"\x01player_\0\0steve\0\0");
                }
                _ => continue,
            }
            let _ = socket.send_to(&reply, from).await;
        }
    });

    address
}

#[tokio::test]
async fn source_info_with_challenge() {
    let address = spawn_source_server().await;

    let info = query::info(&address, QueryFamily::Source, Duration::from_secs(2))
        .await
        .unwrap();
    let info = match info {
        QueryInfo::Source(info) => info,
        other => panic!("expected source info, got {:?}", other),
    };

    assert_eq!(info.protocol, 17);
    assert_eq!(info.name, "Test Server");
    assert_eq!(info.map, "cs_office");
    assert_eq!(info.folder, "cstrike");
    assert_eq!(info.game, "Counter-Strike: Source");
    assert_eq!(info.app_id, 240);
    assert_eq!((info.players, info.max_players, info.bots), (3, 16, 0));
    assert_eq!(info.server_type, ServerType::Dedicated);
    assert_eq!(info.environment, ServerEnvironment::Windows);
    assert!(info.private);
    assert!(info.vac_secured);
}

#[tokio::test]
async fn source_players_with_challenge() {
    let address = spawn_source_server().await;

    let players = query::players(&address, Duration::from_secs(2)).await.unwrap();
    assert_eq!(players.len(), 2);
    assert_eq!(players[0].name, "alice");
    assert_eq!(players[0].score, 12);
    assert_eq!(players[0].duration, 61.5);
    assert_eq!(players[1].name, "bob");
    assert_eq!(players[1].index, 1);
}

#[tokio::test]
async fn minecraft_full_stat() {
    let address = spawn_minecraft_server().await;

    let info = query::info(&address, QueryFamily::Minecraft, Duration::from_secs(2))
        .await
        .unwrap();
    let info = match info {
        QueryInfo::Minecraft(info) => info,
        other => panic!("expected minecraft info, got {:?}", other),
    };

    assert_eq!(info.motd, "A Minecraft Server");
    assert_eq!(info.game_id, "MINECRAFT");
    assert_eq!(info.num_players, 1);
    assert_eq!(info.max_players, 20);
    assert_eq!(info.host_port, 25565);
    assert_eq!(info.players, vec!["steve"]);
}

#[tokio::test]
async fn unanswered_query_times_out() {
    // Bound but never read from
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = silent.local_addr().unwrap().to_string();

    for family in [QueryFamily::Source, QueryFamily::Minecraft] {
        let err = query::info(&address, family, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{}: {}", family, err);
    }
}
