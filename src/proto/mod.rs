use crate::error::MumbleError;
use bytes::{BufMut, Bytes, BytesMut};
use protobuf::Message;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_byteorder::{AsyncReadBytesExt, BigEndian};

pub mod mumble {
    #![allow(clippy::all)]
    #![allow(unused_imports)]

    include!(concat!(env!("OUT_DIR"), "/mumble.rs"));
}

/// Largest control frame payload the server will accept.
pub const MAX_MESSAGE_SIZE: u32 = 8 * 1024 * 1024;

/// Frames skipped while waiting for a specific handshake message. Clients may
/// interleave pings and tunneled voice before the exchange completes.
const MAX_HANDSHAKE_SKIPS: u8 = 5;

/// Control frame catalog. The numeric value is the 2-byte kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Version = 0,
    UDPTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    Acl = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
}

impl TryFrom<u16> for MessageKind {
    type Error = MumbleError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageKind::Version,
            1 => MessageKind::UDPTunnel,
            2 => MessageKind::Authenticate,
            3 => MessageKind::Ping,
            4 => MessageKind::Reject,
            5 => MessageKind::ServerSync,
            6 => MessageKind::ChannelRemove,
            7 => MessageKind::ChannelState,
            8 => MessageKind::UserRemove,
            9 => MessageKind::UserState,
            10 => MessageKind::BanList,
            11 => MessageKind::TextMessage,
            12 => MessageKind::PermissionDenied,
            13 => MessageKind::Acl,
            14 => MessageKind::QueryUsers,
            15 => MessageKind::CryptSetup,
            16 => MessageKind::ContextActionModify,
            17 => MessageKind::ContextAction,
            18 => MessageKind::UserList,
            19 => MessageKind::VoiceTarget,
            20 => MessageKind::PermissionQuery,
            21 => MessageKind::CodecVersion,
            22 => MessageKind::UserStats,
            23 => MessageKind::RequestBlob,
            24 => MessageKind::ServerConfig,
            other => return Err(MumbleError::UnknownMessageKind(other)),
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Serializes a control message with its 6-byte frame header.
pub fn message_to_bytes<T: Message>(kind: MessageKind, message: &T) -> Result<Bytes, MumbleError> {
    let payload = message.write_to_bytes()?;

    let mut buffer = BytesMut::with_capacity(6 + payload.len());
    buffer.put_u16(kind as u16);
    buffer.put_u32(payload.len() as u32);
    buffer.put_slice(&payload);

    Ok(buffer.freeze())
}

/// Reads one raw frame: kind, then payload bytes. The declared length is
/// checked against [`MAX_MESSAGE_SIZE`] before anything is read.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u16, BytesMut), MumbleError> {
    let kind = AsyncReadBytesExt::read_u16::<BigEndian>(stream).await?;
    let length = AsyncReadBytesExt::read_u32::<BigEndian>(stream).await?;

    if length > MAX_MESSAGE_SIZE {
        return Err(MumbleError::FrameTooLarge(length));
    }

    let mut payload = BytesMut::with_capacity(length as usize);
    payload.resize(length as usize, 0);
    stream.read_exact(&mut payload).await?;

    Ok((kind, payload))
}

pub async fn send_message<T: Message, S: AsyncWrite + Unpin>(
    kind: MessageKind,
    message: &T,
    stream: &mut S,
) -> Result<(), MumbleError> {
    let bytes = message_to_bytes(kind, message)?;

    stream.write_all(&bytes).await?;
    stream.flush().await?;

    Ok(())
}

/// Reads frames until one of the expected kind arrives, tolerating a few
/// interleaved Ping/UDPTunnel frames. Any other kind is a handshake
/// violation.
pub async fn expected_message<T: Message, S: AsyncRead + Unpin>(
    kind: MessageKind,
    stream: &mut S,
    depth: u8,
) -> Result<T, MumbleError> {
    let mut skipped = depth;

    loop {
        let (raw_kind, payload) = read_frame(stream).await?;
        let got = MessageKind::try_from(raw_kind)?;

        if got == kind {
            return Ok(T::parse_from_bytes(&payload)?);
        }

        if matches!(got, MessageKind::Ping | MessageKind::UDPTunnel) && skipped < MAX_HANDSHAKE_SKIPS {
            skipped += 1;
            continue;
        }

        return Err(MumbleError::UnexpectedMessageKind(kind, got));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::mumble::Version;

    #[test]
    fn kind_values_round_trip() {
        for value in 0..=24u16 {
            let kind = MessageKind::try_from(value).unwrap();
            assert_eq!(kind as u16, value);
        }

        assert!(MessageKind::try_from(25).is_err());
        assert!(MessageKind::try_from(u16::MAX).is_err());
    }

    #[test]
    fn frame_layout() {
        let mut version = Version::new();
        version.set_version(1 << 16 | 2 << 8 | 2);

        let bytes = message_to_bytes(MessageKind::Version, &version).unwrap();
        let payload_len = u32::from_be_bytes(bytes[2..6].try_into().unwrap()) as usize;

        assert_eq!(&bytes[..2], &[0x00, 0x00]);
        assert_eq!(payload_len, bytes.len() - 6);

        let parsed = Version::parse_from_bytes(&bytes[6..]).unwrap();
        assert_eq!(parsed.get_version(), 1 << 16 | 2 << 8 | 2);
    }

    #[tokio::test]
    async fn read_frame_accepts_empty_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&[0x00, 0x03, 0x00, 0x00, 0x00, 0x00]).await.unwrap();

        let (kind, payload) = read_frame(&mut server).await.unwrap();
        assert_eq!(kind, MessageKind::Ping as u16);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let mut header = vec![0x00, 0x09];
        header.extend_from_slice(&(MAX_MESSAGE_SIZE + 1).to_be_bytes());
        client.write_all(&header).await.unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(MumbleError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn expected_message_rejects_wrong_kind() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let auth = crate::proto::mumble::Authenticate::new();
        let bytes = message_to_bytes(MessageKind::Authenticate, &auth).unwrap();
        client.write_all(&bytes).await.unwrap();

        let result: Result<Version, _> = expected_message(MessageKind::Version, &mut server, 0).await;
        assert!(matches!(
            result,
            Err(MumbleError::UnexpectedMessageKind(MessageKind::Version, MessageKind::Authenticate))
        ));
    }

    #[tokio::test]
    async fn expected_message_skips_early_pings() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let ping = crate::proto::mumble::Ping::new();
        client
            .write_all(&message_to_bytes(MessageKind::Ping, &ping).unwrap())
            .await
            .unwrap();

        let mut version = Version::new();
        version.set_release("t".to_string());
        client
            .write_all(&message_to_bytes(MessageKind::Version, &version).unwrap())
            .await
            .unwrap();

        let received: Version = expected_message(MessageKind::Version, &mut server, 0).await.unwrap();
        assert_eq!(received.get_release(), "t");
    }
}
