use super::{send_permission_denied, Handler};
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::ChannelRemove;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for ChannelRemove {
    async fn handle(&self, state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let session_id = { client.read_err().await?.session_id };
        let channel_id = self.get_channel_id();

        let mut state_write = state.write_err().await?;

        let creator = match state_write.channels.get(&channel_id) {
            Some(channel) => channel.creator,
            None => return Ok(()),
        };

        if creator != Some(session_id) {
            drop(state_write);
            return send_permission_denied(client, "cannot remove a channel you did not create").await;
        }

        state_write.remove_channel(channel_id).await
    }
}
