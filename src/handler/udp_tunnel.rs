use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::state::ServerState;
use crate::sync::RwLock;
use crate::voice::decode_voice_packet;
use bytes::BytesMut;
use std::sync::Arc;

/// Voice over the control channel. The frame payload is a raw voice packet,
/// not a protobuf message; it joins the same routing path as UDP ingress.
pub async fn handle(
    state: &Arc<RwLock<ServerState>>,
    client: &ClientRef,
    mut payload: BytesMut,
) -> Result<(), MumbleError> {
    let packet = decode_voice_packet(&mut payload)?;

    let state_read = state.read_err().await?;

    state_read.route_voice_packet(client, packet).await
}
