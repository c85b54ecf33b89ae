use crate::client::ClientRef;
use crate::server::constants::PING_TIMEOUT_SECS;
use crate::state::ServerState;
use crate::sync::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Reaps clients that stopped pinging on the control channel. A stuck writer
/// also lands here: its client is flagged dead and stops pinging.
pub async fn check_loop(state: Arc<RwLock<ServerState>>) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        interval.tick().await;

        let stale: Vec<(ClientRef, String)> = {
            let state_read = match state.read_err().await {
                Ok(state_read) => state_read,
                Err(_) => continue,
            };

            let mut stale = Vec::new();

            for client in state_read.clients.values() {
                if let Ok(client_read) = client.read_err().await {
                    if client_read.dead || client_read.last_ping.elapsed().as_secs() > PING_TIMEOUT_SECS {
                        stale.push((client.clone(), client_read.username().to_string()));
                    }
                }
            }

            stale
        };

        for (client, username) in stale {
            tracing::info!("disconnecting {} after ping timeout", username);

            if let Ok(mut state_write) = state.write_err().await {
                if let Err(err) = state_write.disconnect(&client).await {
                    tracing::error!("failed to disconnect {}: {}", username, err);
                }
            }
        }
    }
}
