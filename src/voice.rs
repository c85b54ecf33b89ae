use crate::error::MumbleError;
use crate::varint::{read_varint, write_varint};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::marker::PhantomData;

/// 3-bit packet type for a voice ping.
const PING_TYPE: u8 = 1;

/// Loopback target: the server reflects the audio to the sender only.
pub const TARGET_LOOPBACK: u8 = 31;

/// Direct-speech target: routed to the sender's channel.
pub const TARGET_CHANNEL: u8 = 0;

pub trait VoiceDestination {}

/// Marker for packets flowing client → server (no session id in the header).
pub struct ServerBound;

/// Marker for packets flowing server → client (session id follows the header).
pub struct Clientbound;

impl VoiceDestination for ServerBound {}
impl VoiceDestination for Clientbound {}

/// A voice-channel datagram after decryption (or from a TCP tunnel frame).
/// The audio payload stays opaque: codec frames and positional data are
/// ferried, never parsed.
pub enum VoicePacket<Dst: VoiceDestination> {
    Ping {
        timestamp: u64,
    },
    Audio {
        dst: PhantomData<Dst>,
        codec: u8,
        target: u8,
        session_id: Option<u32>,
        seq_num: u64,
        payload: Bytes,
    },
}

pub fn decode_voice_packet(buf: &mut BytesMut) -> Result<VoicePacket<ServerBound>, MumbleError> {
    if !buf.has_remaining() {
        return Err(MumbleError::VoicePacket);
    }

    let header = buf.get_u8();
    let codec = header >> 5;
    let target = header & 0x1F;

    if codec == PING_TYPE {
        let timestamp = read_varint(buf)?;

        return Ok(VoicePacket::Ping { timestamp });
    }

    let seq_num = read_varint(buf)?;

    Ok(VoicePacket::Audio {
        dst: PhantomData,
        codec,
        target,
        session_id: None,
        seq_num,
        payload: buf.split().freeze(),
    })
}

pub fn encode_voice_packet(packet: &VoicePacket<Clientbound>, dest: &mut BytesMut) {
    match packet {
        VoicePacket::Ping { timestamp } => {
            dest.put_u8(PING_TYPE << 5);
            write_varint(dest, *timestamp);
        }
        VoicePacket::Audio {
            codec,
            target,
            session_id,
            seq_num,
            payload,
            ..
        } => {
            dest.put_u8(codec << 5 | (target & 0x1F));

            if let Some(session_id) = session_id {
                write_varint(dest, u64::from(*session_id));
            }

            write_varint(dest, *seq_num);
            dest.put_slice(payload);
        }
    }
}

impl VoicePacket<ServerBound> {
    /// Re-frames a serverbound packet for delivery, stamping the speaking
    /// session into the header.
    pub fn into_client_bound(self, session_id: u32) -> VoicePacket<Clientbound> {
        match self {
            VoicePacket::Ping { timestamp } => VoicePacket::Ping { timestamp },
            VoicePacket::Audio {
                codec,
                target,
                seq_num,
                payload,
                ..
            } => VoicePacket::Audio {
                dst: PhantomData,
                codec,
                target,
                session_id: Some(session_id),
                seq_num,
                payload,
            },
        }
    }
}

impl<Dst: VoiceDestination> VoicePacket<Dst> {
    pub fn target(&self) -> Option<u8> {
        match self {
            VoicePacket::Ping { .. } => None,
            VoicePacket::Audio { target, .. } => Some(*target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ping() {
        let mut buf = BytesMut::new();
        buf.put_u8(PING_TYPE << 5);
        write_varint(&mut buf, 123456);

        match decode_voice_packet(&mut buf).unwrap() {
            VoicePacket::Ping { timestamp } => assert_eq!(timestamp, 123456),
            _ => panic!("expected a ping"),
        }
    }

    #[test]
    fn decode_audio_keeps_payload_opaque() {
        let mut buf = BytesMut::new();
        buf.put_u8(4 << 5 | 2);
        write_varint(&mut buf, 99);
        buf.put_slice(b"opus-frames");

        match decode_voice_packet(&mut buf).unwrap() {
            VoicePacket::Audio {
                codec,
                target,
                session_id,
                seq_num,
                payload,
                ..
            } => {
                assert_eq!(codec, 4);
                assert_eq!(target, 2);
                assert_eq!(session_id, None);
                assert_eq!(seq_num, 99);
                assert_eq!(payload.as_ref(), b"opus-frames");
            }
            _ => panic!("expected audio"),
        }
    }

    #[test]
    fn client_bound_reencode_inserts_session() {
        let mut buf = BytesMut::new();
        buf.put_u8(4 << 5);
        write_varint(&mut buf, 7);
        buf.put_slice(b"frames");

        let packet = decode_voice_packet(&mut buf).unwrap().into_client_bound(42);

        let mut encoded = BytesMut::new();
        encode_voice_packet(&packet, &mut encoded);

        assert_eq!(encoded[0], 4 << 5);

        let mut tail = encoded.clone();
        tail.advance(1);
        assert_eq!(read_varint(&mut tail).unwrap(), 42);
        assert_eq!(read_varint(&mut tail).unwrap(), 7);
        assert_eq!(tail.as_ref(), b"frames");
    }

    #[test]
    fn empty_packet_is_rejected() {
        let mut buf = BytesMut::new();
        assert!(decode_voice_packet(&mut buf).is_err());
    }
}
