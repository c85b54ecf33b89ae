use super::{send_permission_denied, Handler};
use crate::channel::ROOT_CHANNEL_ID;
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::ChannelState;
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for ChannelState {
    async fn handle(&self, state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let session_id = { client.read_err().await?.session_id };

        if !self.has_channel_id() {
            return create_channel(self, state, client, session_id).await;
        }

        let channel_id = self.get_channel_id();
        let mut state_write = state.write_err().await?;

        let creator = match state_write.channels.get(&channel_id) {
            Some(channel) => channel.creator,
            None => return Ok(()),
        };

        if creator != Some(session_id) {
            drop(state_write);
            return send_permission_denied(client, "cannot edit a channel you did not create").await;
        }

        if self.has_parent() && state_write.move_channel(channel_id, self.get_parent()).is_err() {
            drop(state_write);
            return send_permission_denied(client, "channel move would break the tree").await;
        }

        if let Some(channel) = state_write.channels.get_mut(&channel_id) {
            if self.has_name() {
                channel.name = self.get_name().to_string();
            }

            if self.has_description() {
                channel.description = self.get_description().to_string();
            }

            if self.has_position() {
                channel.position = self.get_position();
            }
        }

        let channel_state = state_write
            .channels
            .get(&channel_id)
            .map(|channel| channel.get_channel_state());

        if let Some(channel_state) = channel_state {
            state_write.broadcast_message(MessageKind::ChannelState, &channel_state).await?;
        }

        Ok(())
    }
}

/// Channel creation over the control channel produces temporary channels
/// owned by their creator, who is moved into the new channel immediately.
async fn create_channel(
    message: &ChannelState,
    state: &Arc<RwLock<ServerState>>,
    client: &ClientRef,
    session_id: u32,
) -> Result<(), MumbleError> {
    if message.get_name().is_empty() {
        return send_permission_denied(client, "channel name must not be empty").await;
    }

    let mut state_write = state.write_err().await?;

    let parent = if message.has_parent() { message.get_parent() } else { ROOT_CHANNEL_ID };

    if !state_write.channels.contains_key(&parent) {
        drop(state_write);
        return send_permission_denied(client, "parent channel does not exist").await;
    }

    let mut create = message.clone();
    create.set_parent(parent);
    create.set_temporary(true);

    let channel_id = state_write.add_channel(&create, Some(session_id));

    let channel_state = state_write
        .channels
        .get(&channel_id)
        .map(|channel| channel.get_channel_state());

    if let Some(channel_state) = channel_state {
        state_write.broadcast_message(MessageKind::ChannelState, &channel_state).await?;
    }

    let left_channel = state_write.set_client_channel(client, channel_id).await?;

    let user_state = { client.read_err().await?.get_user_state() };
    state_write.broadcast_message(MessageKind::UserState, &user_state).await?;

    if let Some(left_channel) = left_channel {
        state_write.reap_temporary_channel(left_channel).await?;
    }

    Ok(())
}
