use crate::proto::MessageKind;
use crate::voice::{Clientbound, VoicePacket};
use bytes::Bytes;
use std::sync::Arc;

/// Items on a client's outbound queue, consumed by its writer task. Control
/// frames arrive pre-serialized so broadcast fan-out shares one buffer.
pub enum ClientMessage {
    SendMessage { kind: MessageKind, payload: Bytes },
    SendVoicePacket(Arc<VoicePacket<Clientbound>>),
    Disconnect,
}
