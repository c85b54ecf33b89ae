use super::Handler;
use crate::channel::subtree;
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::TextMessage;
use crate::proto::{message_to_bytes, MessageKind};
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

#[async_trait]
impl Handler for TextMessage {
    async fn handle(&self, state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let session_id = { client.read_err().await?.session_id };

        let mut message = self.clone();
        message.set_actor(session_id);

        let state_read = state.read_err().await?;

        // Channel targets expand to occupants; tree targets to occupants of
        // the whole subtree.
        let mut channels: HashSet<u32> = message.get_channel_id().iter().copied().collect();

        for tree_id in message.get_tree_id() {
            channels.extend(subtree(&state_read.channels, *tree_id));
        }

        let mut recipients: HashSet<u32> = message.get_session().iter().copied().collect();

        for (other_session, other) in &state_read.clients {
            if channels.contains(&other.read_err().await?.channel_id) {
                recipients.insert(*other_session);
            }
        }

        recipients.remove(&session_id);

        let bytes = message_to_bytes(MessageKind::TextMessage, &message)?;

        for recipient in recipients {
            if let Some(other) = state_read.clients.get(&recipient) {
                other.read_err().await?.enqueue_message(MessageKind::TextMessage, bytes.clone());
            }
        }

        Ok(())
    }
}
