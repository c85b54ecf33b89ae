use super::Handler;
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::Ping;
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

#[async_trait]
impl Handler for Ping {
    async fn handle(&self, _state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let mut ping = Ping::new();
        ping.set_timestamp(self.get_timestamp());

        {
            let mut client_write = client.write_err().await?;
            client_write.last_ping = Instant::now();
        }

        {
            let client_read = client.read_err().await?;
            let crypt_state = client_read.crypt_state.read_err().await?;

            ping.set_good(crypt_state.good);
            ping.set_late(crypt_state.late);
            ping.set_lost(crypt_state.lost);
            ping.set_resync(crypt_state.resync);
        }

        client.read_err().await?.send_message(MessageKind::Ping, &ping).await
    }
}
