use super::{send_permission_denied, Handler};
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::UserRemove;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for UserRemove {
    async fn handle(&self, _state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        // Kick and ban are admin operations; this server grants admin to
        // nobody over the control channel.
        send_permission_denied(client, "kick and ban require administrator privileges").await
    }
}
