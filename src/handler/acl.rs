use super::{send_permission_denied, Handler};
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::ACL;
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for ACL {
    async fn handle(&self, _state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        if !self.get_query() {
            // Writing ACLs is an admin operation.
            return send_permission_denied(client, "ACL editing requires administrator privileges").await;
        }

        // Nothing is persisted; a query gets the inherit-everything default.
        let mut reply = ACL::new();
        reply.set_channel_id(self.get_channel_id());
        reply.set_inherit_acls(true);

        client.read_err().await?.send_message(MessageKind::Acl, &reply).await
    }
}
