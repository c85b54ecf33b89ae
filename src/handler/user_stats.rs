use super::Handler;
use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::{UserStats, UserStats_Stats};
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

#[async_trait]
impl Handler for UserStats {
    async fn handle(&self, state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
        let own_session = { client.read_err().await?.session_id };
        let session_id = if self.has_session() { self.get_session() } else { own_session };

        let target = {
            let state_read = state.read_err().await?;
            state_read.get_client_by_session(session_id)
        };

        let target = match target {
            Some(target) => target,
            None => return Ok(()),
        };

        let mut reply = UserStats::new();
        reply.set_session(session_id);

        {
            let target_read = target.read_err().await?;

            {
                let crypt_state = target_read.crypt_state.read_err().await?;

                let mut from_client = UserStats_Stats::new();
                from_client.set_good(crypt_state.good);
                from_client.set_late(crypt_state.late);
                from_client.set_lost(crypt_state.lost);
                from_client.set_resync(crypt_state.resync);
                reply.set_from_client(from_client);
            }

            reply.set_onlinesecs(target_read.connected_at.elapsed().as_secs() as u32);
            reply.set_opus(target_read.use_opus);

            for codec in &target_read.codecs {
                reply.mut_celt_versions().push(*codec);
            }

            reply.set_version(target_read.version.clone());

            // Addresses travel as 16 bytes, v4 mapped into v6 space.
            let address = match target_read.remote_address.ip() {
                IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
                IpAddr::V6(v6) => v6.octets(),
            };
            reply.set_address(address.to_vec());
        }

        client
            .read_err()
            .await?
            .send_message(MessageKind::UserStats, &reply)
            .await
    }
}
