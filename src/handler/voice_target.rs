use super::Handler;
use crate::channel::subtree;
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::VoiceTarget;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for VoiceTarget {
    async fn handle(&self, state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let id = self.get_id() as usize;

        // Expand channel targets before taking the client lock.
        let mut sessions = Vec::new();
        let mut channels = Vec::new();

        {
            let state_read = state.read_err().await?;

            for target in self.get_targets() {
                sessions.extend_from_slice(target.get_session());

                if target.has_channel_id() {
                    if target.get_children() {
                        channels.extend(subtree(&state_read.channels, target.get_channel_id()));
                    } else {
                        channels.push(target.get_channel_id());
                    }
                }
            }
        }

        let mut client_write = client.write_err().await?;

        let slot = match client_write.get_target_mut(id) {
            Some(slot) => slot,
            None => {
                tracing::warn!("voice target id {} out of range", id);
                return Ok(());
            }
        };

        slot.clear();
        slot.sessions.extend(sessions);
        slot.channels.extend(channels);

        Ok(())
    }
}
