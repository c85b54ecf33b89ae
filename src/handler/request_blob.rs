use super::Handler;
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::{ChannelState, RequestBlob, UserState};
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

/// Serves the blobs this server actually stores: user comments and channel
/// descriptions. Texture requests are ignored.
#[async_trait]
impl Handler for RequestBlob {
    async fn handle(&self, state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let client_read = client.read_err().await?;
        let state_read = state.read_err().await?;

        for session_id in self.get_session_comment() {
            if let Some(target) = state_read.get_client_by_session(*session_id) {
                let comment = { target.read_err().await?.comment.clone() };

                if let Some(comment) = comment {
                    let mut user_state = UserState::new();
                    user_state.set_session(*session_id);
                    user_state.set_comment(comment);

                    client_read.send_message(MessageKind::UserState, &user_state).await?;
                }
            }
        }

        for channel_id in self.get_channel_description() {
            if let Some(channel) = state_read.channels.get(channel_id) {
                let mut channel_state = ChannelState::new();
                channel_state.set_channel_id(*channel_id);
                channel_state.set_description(channel.description.clone());

                client_read.send_message(MessageKind::ChannelState, &channel_state).await?;
            }
        }

        Ok(())
    }
}
