use crate::proto::MessageKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MumbleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protobuf decode error: {0}")]
    Parse(#[from] protobuf::ProtobufError),
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u16),
    #[error("unexpected message kind: expected {0}, got {1}")]
    UnexpectedMessageKind(MessageKind, MessageKind),
    #[error("frame of {0} bytes exceeds the maximum allowed size")]
    FrameTooLarge(u32),
    #[error("cannot decrypt voice packet")]
    Decrypt,
    #[error("cannot initialize crypt state")]
    CryptInit,
    #[error("malformed voice packet")]
    VoicePacket,
    #[error("username is missing from the authenticate message")]
    MissingUsername,
    #[error("server is full")]
    ServerFull,
    #[error("channel operation violates the tree invariants")]
    ChannelTree,
    #[error("operation timed out")]
    Timeout,
    #[error("client send queue is closed")]
    QueueClosed,
}

impl From<ring::error::Unspecified> for MumbleError {
    fn from(_: ring::error::Unspecified) -> Self {
        MumbleError::CryptInit
    }
}
