mod acl;
mod ban_list;
mod channel_remove;
mod channel_state;
mod crypt_setup;
mod permission_query;
mod ping;
mod query_users;
mod request_blob;
mod text_message;
mod udp_tunnel;
mod user_remove;
mod user_state;
mod user_stats;
mod voice_target;

use crate::client::ClientRef;
use crate::error::MumbleError;
use crate::proto::mumble::{
    ChannelRemove, ChannelState, CryptSetup, PermissionDenied, PermissionDenied_DenyType, PermissionQuery, Ping,
    QueryUsers, RequestBlob, TextMessage, UserRemove, UserState, UserStats, VoiceTarget, ACL,
};
use crate::proto::MessageKind;
use crate::state::ServerState;
use crate::sync::RwLock;
use async_trait::async_trait;
use bytes::BytesMut;
use protobuf::Message;
use std::sync::Arc;

#[async_trait]
pub trait Handler {
    async fn handle(&self, state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError>;
}

/// Routes one post-handshake control frame. The caller is the single
/// dispatcher task, so handlers run with a total order across all clients.
pub async fn handle_message(
    state: &Arc<RwLock<ServerState>>,
    client: &ClientRef,
    kind: MessageKind,
    payload: BytesMut,
) -> Result<(), MumbleError> {
    crate::metrics::MESSAGES_TOTAL
        .with_label_values(&["tcp", "input", kind.to_string().as_str()])
        .inc();

    crate::metrics::MESSAGES_BYTES
        .with_label_values(&["tcp", "input", kind.to_string().as_str()])
        .inc_by(payload.len() as u64);

    let _timer = crate::metrics::MESSAGE_PROCESS_SECONDS.start_timer();

    match kind {
        MessageKind::Ping => Ping::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::UDPTunnel => udp_tunnel::handle(state, client, payload).await,
        MessageKind::UserState => UserState::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::UserRemove => UserRemove::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::ChannelState => ChannelState::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::ChannelRemove => ChannelRemove::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::TextMessage => TextMessage::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::CryptSetup => CryptSetup::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::VoiceTarget => VoiceTarget::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::PermissionQuery => PermissionQuery::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::QueryUsers => QueryUsers::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::UserStats => UserStats::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::Acl => ACL::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::BanList => crate::proto::mumble::BanList::parse_from_bytes(&payload)?.handle(state, client).await,
        MessageKind::RequestBlob => RequestBlob::parse_from_bytes(&payload)?.handle(state, client).await,
        // The server owns the codec pair; client announcements carry nothing.
        MessageKind::CodecVersion => Ok(()),
        // No registered-user storage: the answer is always an empty list.
        MessageKind::UserList => {
            let reply = crate::proto::mumble::UserList::new();
            client.read_err().await?.send_message(MessageKind::UserList, &reply).await
        }
        // Accepted and ignored: no server-side behavior is attached.
        MessageKind::ContextAction | MessageKind::ContextActionModify => {
            tracing::trace!("ignoring {} message", kind);
            Ok(())
        }
        // Already exchanged during the handshake; late repeats are harmless.
        MessageKind::Version | MessageKind::Authenticate => {
            tracing::warn!("ignoring {} after authentication", kind);
            Ok(())
        }
        // Server-to-client kinds have no business arriving here.
        MessageKind::Reject
        | MessageKind::ServerSync
        | MessageKind::ServerConfig
        | MessageKind::PermissionDenied => {
            tracing::warn!("ignoring client-sent {} message", kind);
            Ok(())
        }
    }
}

/// Default-deny reply for operations gated on privileges this server does
/// not grant.
pub async fn send_permission_denied(client: &ClientRef, reason: &str) -> Result<(), MumbleError> {
    let mut denied = PermissionDenied::new();
    denied.set_field_type(PermissionDenied_DenyType::Permission);
    denied.set_reason(reason.to_string());

    client
        .read_err()
        .await?
        .send_message(MessageKind::PermissionDenied, &denied)
        .await
}
