use super::{send_permission_denied, Handler};
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::BanList;
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for BanList {
    async fn handle(&self, _state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        if !self.get_query() {
            return send_permission_denied(client, "ban list editing requires administrator privileges").await;
        }

        // No ban storage: the list is empty by construction.
        let mut reply = BanList::new();
        reply.set_query(false);

        client.read_err().await?.send_message(MessageKind::BanList, &reply).await
    }
}
