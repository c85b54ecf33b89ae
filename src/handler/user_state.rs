use super::{send_permission_denied, Handler};
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::UserState;
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for UserState {
    async fn handle(&self, state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let session_id = { client.read_err().await?.session_id };

        // No privilege model: nobody gets to mutate anyone else.
        if self.has_session() && self.get_session() != session_id {
            return send_permission_denied(client, "cannot modify another user").await;
        }

        {
            client.write_err().await?.update(self);
        }

        let left_channel = if self.has_channel_id() {
            let mut state_write = state.write_err().await?;
            state_write.set_client_channel(client, self.get_channel_id()).await?
        } else {
            None
        };

        // One authoritative state goes out, whatever subset the client sent.
        let user_state = { client.read_err().await?.get_user_state() };

        {
            let state_read = state.read_err().await?;
            state_read.broadcast_message(MessageKind::UserState, &user_state).await?;
        }

        if let Some(left_channel) = left_channel {
            let mut state_write = state.write_err().await?;
            state_write.reap_temporary_channel(left_channel).await?;
        }

        Ok(())
    }
}
