use super::Handler;
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::QueryUsers;
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for QueryUsers {
    async fn handle(&self, state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let mut reply = QueryUsers::new();

        {
            let state_read = state.read_err().await?;

            for id in self.get_ids() {
                if let Some(other) = state_read.get_client_by_session(*id) {
                    reply.mut_ids().push(*id);
                    reply.mut_names().push(other.read_err().await?.username().to_string());
                }
            }

            for name in self.get_names() {
                if let Some(other) = state_read.get_client_by_name(name).await? {
                    reply.mut_ids().push(other.read_err().await?.session_id);
                    reply.mut_names().push(name.to_string());
                }
            }
        }

        client
            .read_err()
            .await?
            .send_message(MessageKind::QueryUsers, &reply)
            .await
    }
}
