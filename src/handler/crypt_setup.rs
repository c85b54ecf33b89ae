use super::Handler;
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::CryptSetup;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
impl Handler for CryptSetup {
    async fn handle(&self, _state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let client_read = client.read_err().await?;

        if self.has_client_nonce() {
            // The client reports its encrypt nonce; adopt it for our decrypt
            // direction and keep the rest of the context.
            let mut crypt_state = client_read.crypt_state.write_err().await?;

            return crypt_state.set_decrypt_nonce(self.get_client_nonce());
        }

        // An empty request asks for a whole new context; the previous key and
        // nonces stop working the moment this is sent.
        client_read.send_crypt_setup(true).await
    }
}
