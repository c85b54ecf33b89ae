use crate::channel::{tree_order, would_create_cycle, Channel, ROOT_CHANNEL_ID};
use crate::client::{Client, ClientRef};
use crate::crypt::CryptState;
use crate::error::MumbleError;
use crate::message::ClientMessage;
use crate::proto::mumble::{Authenticate, ChannelRemove, ChannelState, CodecVersion, UserRemove, UserState, Version};
use crate::proto::{message_to_bytes, MessageKind};
use crate::server::constants::MAX_CLIENTS;
use crate::sync::RwLock;
use crate::voice::{ServerBound, VoicePacket, TARGET_CHANNEL, TARGET_LOOPBACK};
use bytes::BytesMut;
use protobuf::Message;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::WriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::Sender;
use tokio_rustls::server::TlsStream;

/// Bitstream version of the legacy CELT build every client ships. A winner
/// equal to this constant is pinned to the alpha slot.
pub const CELT_COMPAT_VERSION: i32 = -2147483638;

pub struct CodecState {
    pub opus: bool,
    pub alpha: i32,
    pub beta: i32,
    pub prefer_alpha: bool,
}

impl Default for CodecState {
    fn default() -> Self {
        Self {
            opus: true,
            alpha: 0,
            beta: 0,
            prefer_alpha: false,
        }
    }
}

impl CodecState {
    pub fn current(&self) -> i32 {
        if self.prefer_alpha {
            return self.alpha;
        }

        self.beta
    }

    /// Installs an election result. The winner replaces the slot that becomes
    /// preferred; the other slot keeps serving clients mid-transition.
    /// Returns true when anything observable changed.
    pub fn apply(&mut self, winner: i32, opus: bool) -> bool {
        let opus_changed = self.opus != opus;
        self.opus = opus;

        if winner == self.current() {
            return opus_changed;
        }

        if winner == CELT_COMPAT_VERSION {
            self.prefer_alpha = true;
        } else {
            self.prefer_alpha = !self.prefer_alpha;
        }

        if self.prefer_alpha {
            self.alpha = winner;
        } else {
            self.beta = winner;
        }

        true
    }

    pub fn get_codec_version(&self) -> CodecVersion {
        let mut codec_version = CodecVersion::default();
        codec_version.set_alpha(self.alpha);
        codec_version.set_beta(self.beta);
        codec_version.set_opus(self.opus);
        codec_version.set_prefer_alpha(self.prefer_alpha);

        codec_version
    }
}

/// Histogram election over advertised codec lists. Ties go to the codec seen
/// first in iteration order, which callers keep deterministic by sorting.
pub fn elect_codec<'a>(lists: impl Iterator<Item = &'a [i32]>) -> Option<i32> {
    let mut counts: Vec<(i32, u32)> = Vec::new();

    for list in lists {
        for codec in list {
            match counts.iter_mut().find(|(candidate, _)| candidate == codec) {
                Some((_, count)) => *count += 1,
                None => counts.push((*codec, 1)),
            }
        }
    }

    let mut winner = None;
    let mut best = 0;

    for (codec, count) in counts {
        if count > best {
            winner = Some(codec);
            best = count;
        }
    }

    winner
}

pub struct ServerSettings {
    pub max_users: u32,
    pub max_bandwidth: u32,
    pub welcome_text: String,
}

pub struct ServerState {
    pub clients: HashMap<u32, ClientRef>,
    pub clients_by_socket: HashMap<SocketAddr, ClientRef>,
    pub channels: HashMap<u32, Channel>,
    pub codec_state: CodecState,
    pub socket: Arc<UdpSocket>,
    pub settings: ServerSettings,
    session_counter: AtomicU32,
}

impl ServerState {
    pub fn new(socket: Arc<UdpSocket>, settings: ServerSettings) -> Self {
        let mut channels = HashMap::new();
        channels.insert(ROOT_CHANNEL_ID, Channel::root());

        Self {
            // preallocate the maximum amount of clients so the maps never
            // resize mid-broadcast
            clients: HashMap::with_capacity(MAX_CLIENTS),
            clients_by_socket: HashMap::with_capacity(MAX_CLIENTS),
            channels,
            codec_state: CodecState::default(),
            socket,
            settings,
            session_counter: AtomicU32::new(0),
        }
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.settings.max_users as usize
    }

    /// Admits an authenticated connection: allocates the next session id and
    /// registers the client in the roster. Session ids start at 1 and never
    /// repeat for the lifetime of the server.
    #[allow(clippy::too_many_arguments)]
    pub fn add_client(
        &mut self,
        version: Version,
        authenticate: Authenticate,
        crypt_state: CryptState,
        write: WriteHalf<TlsStream<TcpStream>>,
        remote_address: SocketAddr,
        publisher: Sender<ClientMessage>,
    ) -> ClientRef {
        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;

        let client = Arc::new(RwLock::new(Client::new(
            version,
            authenticate,
            session_id,
            ROOT_CHANNEL_ID,
            crypt_state,
            write,
            remote_address,
            self.socket.clone(),
            publisher,
        )));

        crate::metrics::CLIENTS_TOTAL.inc();
        self.clients.insert(session_id, client.clone());

        client
    }

    pub fn get_client_by_session(&self, session_id: u32) -> Option<ClientRef> {
        self.clients.get(&session_id).cloned()
    }

    pub async fn get_client_by_name(&self, name: &str) -> Result<Option<ClientRef>, MumbleError> {
        for client in self.clients.values() {
            if client.read_err().await?.username() == name {
                return Ok(Some(client.clone()));
            }
        }

        Ok(None)
    }

    pub fn get_client_by_socket(&self, socket_addr: &SocketAddr) -> Option<ClientRef> {
        self.clients_by_socket.get(socket_addr).cloned()
    }

    /// Records a discovered UDP peer, replacing any previous mapping for the
    /// client.
    pub async fn set_client_socket(&mut self, client: ClientRef, addr: SocketAddr) -> Result<(), MumbleError> {
        let existing = {
            let mut client_write = client.write_err().await?;
            client_write.udp_socket_addr.replace(addr)
        };

        if let Some(existing_addr) = existing {
            self.clients_by_socket.remove(&existing_addr);
        }

        self.clients_by_socket.insert(addr, client);

        Ok(())
    }

    pub async fn forget_client_socket(&mut self, client: &ClientRef) -> Result<(), MumbleError> {
        let existing = {
            let mut client_write = client.write_err().await?;
            client_write.udp_socket_addr.take()
        };

        if let Some(addr) = existing {
            self.clients_by_socket.remove(&addr);
        }

        Ok(())
    }

    /// Serializes once, then enqueues on every live client. A stuck or full
    /// queue drops the frame for that client only; fan-out never stalls.
    pub async fn broadcast_message<T: Message>(&self, kind: MessageKind, message: &T) -> Result<(), MumbleError> {
        self.fan_out(kind, message, None).await
    }

    /// Broadcast that skips one session: used for announcements the excluded
    /// client receives over its own ordered sync path instead.
    pub async fn broadcast_message_except<T: Message>(
        &self,
        kind: MessageKind,
        message: &T,
        except: u32,
    ) -> Result<(), MumbleError> {
        self.fan_out(kind, message, Some(except)).await
    }

    async fn fan_out<T: Message>(&self, kind: MessageKind, message: &T, except: Option<u32>) -> Result<(), MumbleError> {
        tracing::trace!("broadcast message: {:?}, {:?}", std::any::type_name::<T>(), message);

        let bytes = message_to_bytes(kind, message)?;

        for (session_id, client) in &self.clients {
            if Some(*session_id) == except {
                continue;
            }

            match client.read_err().await {
                Ok(client_read) => client_read.enqueue_message(kind, bytes.clone()),
                Err(err) => {
                    tracing::error!("failed to read client during broadcast: {}", err);
                }
            }
        }

        Ok(())
    }

    /// Re-elects the active codec pair from the advertised lists of all
    /// connected clients and broadcasts the result when it changed.
    pub async fn check_codec(&mut self) -> Result<(), MumbleError> {
        let mut sessions: Vec<u32> = self.clients.keys().copied().collect();
        sessions.sort_unstable();

        let mut lists: Vec<Vec<i32>> = Vec::with_capacity(sessions.len());
        let mut opus = true;

        for session_id in &sessions {
            if let Some(client) = self.clients.get(session_id) {
                let client_read = client.read_err().await?;
                lists.push(client_read.codecs.clone());
                opus &= client_read.use_opus;
            }
        }

        let winner = match elect_codec(lists.iter().map(|list| list.as_slice())) {
            Some(winner) => winner,
            None => return Ok(()),
        };

        if !self.codec_state.apply(winner, opus) {
            return Ok(());
        }

        let codec_version = self.codec_state.get_codec_version();

        tracing::debug!(
            "codec election: alpha {} beta {} prefer_alpha {}",
            codec_version.get_alpha(),
            codec_version.get_beta(),
            codec_version.get_prefer_alpha()
        );

        self.broadcast_message(MessageKind::CodecVersion, &codec_version).await
    }

    /// Owner lookup by trial decryption, for datagrams from an address no
    /// client has claimed yet. First context that authenticates the packet
    /// wins. O(N) by design; the per-packet cost disappears once the peer
    /// address is learned.
    pub async fn find_client_with_decrypt(
        &self,
        bytes: &[u8],
    ) -> Result<Option<(ClientRef, BytesMut)>, MumbleError> {
        for client in self.clients.values() {
            let result = {
                let client_read = client.read_err().await?;
                let mut crypt_state = client_read.crypt_state.write_err().await?;
                crypt_state.decrypt(bytes)
            };

            match result {
                Ok(plain) => return Ok(Some((client.clone(), plain))),
                Err(err) => {
                    tracing::debug!("failed to decrypt packet: {}, continue to next client", err);
                }
            }
        }

        Ok(None)
    }

    /// Routes one decrypted (or tunneled) voice packet from `from` to its
    /// recipients. Queue overflow drops audio for the slow client only.
    pub async fn route_voice_packet(
        &self,
        from: &ClientRef,
        packet: VoicePacket<ServerBound>,
    ) -> Result<(), MumbleError> {
        let (session_id, channel_id, target) = {
            let client_read = from.read_err().await?;
            (client_read.session_id, client_read.channel_id, packet.target())
        };

        let client_bound = Arc::new(packet.into_client_bound(session_id));

        let target = match target {
            // Voice pings bounce straight back.
            None => {
                self.enqueue_voice(from, client_bound).await?;
                return Ok(());
            }
            Some(target) => target,
        };

        if target == TARGET_LOOPBACK {
            self.enqueue_voice(from, client_bound).await?;
            return Ok(());
        }

        let mut recipients: HashSet<u32> = HashSet::new();

        if target == TARGET_CHANNEL {
            for (other_session, client) in &self.clients {
                if *other_session == session_id {
                    continue;
                }

                if client.read_err().await?.channel_id == channel_id {
                    recipients.insert(*other_session);
                }
            }
        } else {
            let (sessions, channels) = {
                let client_read = from.read_err().await?;

                match client_read.get_target(target as usize) {
                    Some(slot) => (slot.sessions.clone(), slot.channels.clone()),
                    None => return Ok(()),
                }
            };

            recipients.extend(&sessions);

            for (other_session, client) in &self.clients {
                if channels.contains(&client.read_err().await?.channel_id) {
                    recipients.insert(*other_session);
                }
            }

            recipients.remove(&session_id);
        }

        for recipient in recipients {
            if let Some(client) = self.clients.get(&recipient) {
                if client.read_err().await?.is_deafened() {
                    continue;
                }

                self.enqueue_voice(client, client_bound.clone()).await?;
            }
        }

        Ok(())
    }

    async fn enqueue_voice(
        &self,
        client: &ClientRef,
        packet: Arc<VoicePacket<crate::voice::Clientbound>>,
    ) -> Result<(), MumbleError> {
        let client_read = client.read_err().await?;

        if client_read.dead {
            return Ok(());
        }

        if let Err(err) = client_read.publisher.try_send(ClientMessage::SendVoicePacket(packet)) {
            tracing::debug!("voice queue full for {}: {}", client_read.username(), err);
        }

        Ok(())
    }

    pub fn add_channel(&mut self, state: &ChannelState, creator: Option<u32>) -> u32 {
        let channel_id = self.get_free_channel_id();

        let mut channel = Channel::new(
            channel_id,
            Some(state.get_parent()),
            state.get_name().to_string(),
            state.get_description().to_string(),
            state.get_temporary(),
        );
        channel.position = state.get_position();
        channel.creator = creator;

        tracing::debug!("created channel {} with name {}", channel_id, state.get_name());

        self.channels.insert(channel_id, channel);

        channel_id
    }

    /// Rejects reparenting that would detach the tree or close a loop.
    pub fn move_channel(&mut self, channel_id: u32, new_parent: u32) -> Result<(), MumbleError> {
        if channel_id == ROOT_CHANNEL_ID
            || !self.channels.contains_key(&new_parent)
            || would_create_cycle(&self.channels, channel_id, new_parent)
        {
            return Err(MumbleError::ChannelTree);
        }

        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.parent = Some(new_parent);
        }

        Ok(())
    }

    /// Removes a channel, reparenting any occupants to the root channel and
    /// broadcasting both the moves and the removal.
    pub async fn remove_channel(&mut self, channel_id: u32) -> Result<(), MumbleError> {
        if channel_id == ROOT_CHANNEL_ID || self.channels.remove(&channel_id).is_none() {
            return Ok(());
        }

        // Orphaned subtrees hang onto the root as well.
        let orphans: Vec<u32> = self
            .channels
            .values()
            .filter(|channel| channel.parent == Some(channel_id))
            .map(|channel| channel.id)
            .collect();

        for orphan in orphans {
            if let Some(channel) = self.channels.get_mut(&orphan) {
                channel.parent = Some(ROOT_CHANNEL_ID);
            }
        }

        for client in self.clients.values() {
            let moved = {
                let mut client_write = client.write_err().await?;

                if client_write.channel_id == channel_id {
                    client_write.channel_id = ROOT_CHANNEL_ID;
                    Some(client_write.get_user_state())
                } else {
                    None
                }
            };

            if let Some(user_state) = moved {
                self.broadcast_message(MessageKind::UserState, &user_state).await?;
            }
        }

        let mut channel_remove = ChannelRemove::new();
        channel_remove.set_channel_id(channel_id);

        self.broadcast_message(MessageKind::ChannelRemove, &channel_remove).await
    }

    /// Moves a client between channels. Returns the channel left behind so
    /// the caller can broadcast the move and reap an abandoned temporary
    /// channel; `None` when nothing changed.
    pub async fn set_client_channel(&mut self, client: &ClientRef, channel_id: u32) -> Result<Option<u32>, MumbleError> {
        if !self.channels.contains_key(&channel_id) {
            return Ok(None);
        }

        let mut client_write = client.write_err().await?;

        Ok(client_write.join_channel(channel_id))
    }

    /// Drops a temporary channel nobody occupies anymore.
    pub async fn reap_temporary_channel(&mut self, channel_id: u32) -> Result<(), MumbleError> {
        match self.channels.get(&channel_id) {
            Some(channel) if channel.temporary => {}
            _ => return Ok(()),
        }

        for client in self.clients.values() {
            if client.read_err().await?.channel_id == channel_id {
                return Ok(());
            }
        }

        self.channels.remove(&channel_id);

        let mut channel_remove = ChannelRemove::new();
        channel_remove.set_channel_id(channel_id);

        self.broadcast_message(MessageKind::ChannelRemove, &channel_remove).await
    }

    /// Removes a client from the roster and tells everyone else. The client's
    /// writer task is stopped through its queue; its tasks observe `dead`.
    pub async fn disconnect(&mut self, client: &ClientRef) -> Result<(), MumbleError> {
        let (session_id, channel_id, udp_addr) = {
            let mut client_write = client.write_err().await?;

            client_write.dead = true;
            let _ = client_write.publisher.try_send(ClientMessage::Disconnect);

            (
                client_write.session_id,
                client_write.channel_id,
                client_write.udp_socket_addr.take(),
            )
        };

        // Roster membership is the idempotence guard: a client can be flagged
        // dead by several tasks, but only the first remover broadcasts.
        if self.clients.remove(&session_id).is_none() {
            return Ok(());
        }

        crate::metrics::CLIENTS_TOTAL.dec();

        if let Some(addr) = udp_addr {
            self.clients_by_socket.remove(&addr);
        }

        let mut remove = UserRemove::new();
        remove.set_session(session_id);
        remove.set_reason("disconnected".to_string());

        self.broadcast_message(MessageKind::UserRemove, &remove).await?;
        self.reap_temporary_channel(channel_id).await?;
        self.check_codec().await?;

        Ok(())
    }

    /// Snapshot of the channel tree (root first) and the user roster, for a
    /// freshly authenticated client. Channels must arrive before the user
    /// states that reference them.
    pub async fn collect_sync(&self) -> Result<(Vec<ChannelState>, Vec<UserState>), MumbleError> {
        let channel_states = tree_order(&self.channels)
            .iter()
            .filter_map(|id| self.channels.get(id))
            .map(Channel::get_channel_state)
            .collect();

        let mut sessions: Vec<u32> = self.clients.keys().copied().collect();
        sessions.sort_unstable();

        let mut user_states = Vec::with_capacity(sessions.len());

        for session_id in sessions {
            if let Some(client) = self.clients.get(&session_id) {
                user_states.push(client.read_err().await?.get_user_state());
            }
        }

        Ok((channel_states, user_states))
    }

    fn get_free_channel_id(&self) -> u32 {
        let mut channel_id = 1;

        loop {
            if self.channels.contains_key(&channel_id) {
                channel_id += 1;
            } else {
                break;
            }
        }

        channel_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_prefers_highest_count_first_seen_tiebreak() {
        let lists: Vec<Vec<i32>> = vec![vec![10], vec![10, 20], vec![20]];
        assert_eq!(elect_codec(lists.iter().map(|l| l.as_slice())), Some(10));

        let empty: Vec<Vec<i32>> = vec![];
        assert_eq!(elect_codec(empty.iter().map(|l| l.as_slice())), None);
    }

    #[test]
    fn new_winner_flips_preference_into_fresh_slot() {
        let mut codec_state = CodecState::default();

        // current = beta = 0; a new winner flips preference to alpha.
        assert!(codec_state.apply(77, true));
        assert!(codec_state.prefer_alpha);
        assert_eq!(codec_state.alpha, 77);
        assert_eq!(codec_state.beta, 0);

        // Same winner again: no change.
        assert!(!codec_state.apply(77, true));

        // Another new winner flips back into beta.
        assert!(codec_state.apply(99, true));
        assert!(!codec_state.prefer_alpha);
        assert_eq!(codec_state.beta, 99);
        assert_eq!(codec_state.alpha, 77);
        assert_ne!(codec_state.alpha, codec_state.beta);
    }

    #[test]
    fn compat_bitstream_pins_alpha() {
        let mut codec_state = CodecState {
            opus: false,
            alpha: 5,
            beta: 6,
            prefer_alpha: true,
        };

        assert!(codec_state.apply(CELT_COMPAT_VERSION, false));
        assert!(codec_state.prefer_alpha);
        assert_eq!(codec_state.alpha, CELT_COMPAT_VERSION);
        assert_eq!(codec_state.beta, 6);
    }

    #[test]
    fn opus_change_alone_still_broadcasts() {
        let mut codec_state = CodecState::default();
        assert!(codec_state.apply(77, true));

        assert!(codec_state.apply(77, false));
        assert!(!codec_state.opus);
    }
}
