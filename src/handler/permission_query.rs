use super::Handler;
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::PermissionQuery;
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// Enter, Speak, Whisper and TextMessage, the set every user holds here.
const DEFAULT_PERMISSIONS: u32 = 0x04 | 0x08 | 0x100 | 0x200;

#[async_trait]
impl Handler for PermissionQuery {
    async fn handle(&self, _state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let mut reply = PermissionQuery::new();

        if self.has_channel_id() {
            reply.set_channel_id(self.get_channel_id());
        }

        reply.set_permissions(DEFAULT_PERMISSIONS);

        client
            .read_err()
            .await?
            .send_message(MessageKind::PermissionQuery, &reply)
            .await
    }
}
