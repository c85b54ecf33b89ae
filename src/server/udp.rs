use crate::error::MumbleError;
use crate::server::constants::{CRYPT_STALE_MILLIS, MAX_UDP_DATAGRAM};
use crate::state::ServerState;
use crate::sync::RwLock;
use crate::voice::decode_voice_packet;
use byteorder::{BigEndian, ByteOrder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Stateless probes are exactly this long: a 4-byte request type and an
/// 8-byte client identifier. Anything else is voice.
const PING_REQUEST_SIZE: usize = 12;
const PING_REPLY_SIZE: usize = 24;

pub async fn create_udp_server(protocol_version: u32, socket: Arc<UdpSocket>, state: Arc<RwLock<ServerState>>) {
    let mut buffer = [0u8; MAX_UDP_DATAGRAM];

    loop {
        let (size, addr) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(err) => {
                tracing::error!("failed to receive udp datagram: {}", err);
                continue;
            }
        };

        let data = &buffer[..size];

        crate::metrics::MESSAGES_TOTAL.with_label_values(&["udp", "input", "VoicePacket"]).inc();
        crate::metrics::MESSAGES_BYTES
            .with_label_values(&["udp", "input", "VoicePacket"])
            .inc_by(size as u64);

        if size == PING_REQUEST_SIZE {
            let reply = match ping_reply(protocol_version, &state, data).await {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::debug!("ignoring malformed ping from {}: {}", addr, err);
                    continue;
                }
            };

            if let Err(err) = socket.send_to(&reply, addr).await {
                tracing::debug!("failed to answer ping from {}: {}", addr, err);
            }

            continue;
        }

        if let Err(err) = handle_voice_datagram(&state, addr, data).await {
            tracing::debug!("dropping datagram from {}: {}", addr, err);
        }
    }
}

async fn ping_reply(
    protocol_version: u32,
    state: &Arc<RwLock<ServerState>>,
    data: &[u8],
) -> Result<[u8; PING_REPLY_SIZE], MumbleError> {
    let (user_count, max_users, max_bandwidth) = {
        let state_read = state.read_err().await?;
        (
            state_read.clients.len() as u32,
            state_read.settings.max_users,
            state_read.settings.max_bandwidth,
        )
    };

    Ok(encode_ping_reply(
        protocol_version,
        &data[4..12],
        user_count,
        max_users,
        max_bandwidth,
    ))
}

/// Wire layout of the reply: packed version, the echoed identifier, then
/// current users, user cap and bandwidth cap, all big-endian.
fn encode_ping_reply(
    protocol_version: u32,
    identifier: &[u8],
    user_count: u32,
    max_users: u32,
    max_bandwidth: u32,
) -> [u8; PING_REPLY_SIZE] {
    let mut reply = [0u8; PING_REPLY_SIZE];

    BigEndian::write_u32(&mut reply[0..4], protocol_version);
    reply[4..12].copy_from_slice(identifier);
    BigEndian::write_u32(&mut reply[12..16], user_count);
    BigEndian::write_u32(&mut reply[16..20], max_users);
    BigEndian::write_u32(&mut reply[20..24], max_bandwidth);

    reply
}

/// Finds the owner of an encrypted datagram and routes the plaintext. Known
/// source addresses decrypt directly; unknown ones go through trial
/// decryption against every client. Packets nobody can authenticate are
/// dropped without a reply.
async fn handle_voice_datagram(
    state: &Arc<RwLock<ServerState>>,
    addr: SocketAddr,
    data: &[u8],
) -> Result<(), MumbleError> {
    let known = {
        let state_read = state.read_err().await?;
        state_read.get_client_by_socket(&addr)
    };

    if let Some(client) = known {
        let (result, stale) = {
            let client_read = client.read_err().await?;
            let mut crypt_state = client_read.crypt_state.write_err().await?;

            let result = crypt_state.decrypt(data);
            let stale = crypt_state.last_good.elapsed().as_millis() > CRYPT_STALE_MILLIS;

            (result, stale)
        };

        match result {
            Ok(mut plain) => {
                let packet = decode_voice_packet(&mut plain)?;

                let state_read = state.read_err().await?;
                return state_read.route_voice_packet(&client, packet).await;
            }
            Err(err) => {
                // A learned peer that stopped decrypting has lost nonce sync
                // or handed its address to someone else. Force rediscovery.
                if stale {
                    client.read_err().await?.send_crypt_setup(true).await?;

                    let mut state_write = state.write_err().await?;
                    state_write.forget_client_socket(&client).await?;
                }

                return Err(err);
            }
        }
    }

    let discovered = {
        let state_read = state.read_err().await?;
        state_read.find_client_with_decrypt(data).await?
    };

    let (client, mut plain) = match discovered {
        Some(found) => found,
        None => return Ok(()),
    };

    {
        let mut state_write = state.write_err().await?;
        state_write.set_client_socket(client.clone(), addr).await?;
    }

    tracing::debug!("associated {} with udp peer {}", client.read_err().await?.username(), addr);

    let packet = decode_voice_packet(&mut plain)?;

    let state_read = state.read_err().await?;
    state_read.route_voice_packet(&client, packet).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::constants::PROTOCOL_VERSION;

    #[test]
    fn ping_reply_layout() {
        let identifier = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let reply = encode_ping_reply(PROTOCOL_VERSION, &identifier, 3, 10, 300000);

        assert_eq!(&reply[0..4], &[0x00, 0x01, 0x02, 0x02]);
        assert_eq!(&reply[4..12], &identifier);
        assert_eq!(&reply[12..16], &[0x00, 0x00, 0x00, 0x03]);
        assert_eq!(&reply[16..20], &[0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(&reply[20..24], &[0x00, 0x04, 0x93, 0xE0]);
    }
}
