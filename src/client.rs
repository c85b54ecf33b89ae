use crate::crypt::CryptState;
use crate::error::MumbleError;
use crate::message::ClientMessage;
use crate::proto::mumble::{Authenticate, Reject, Reject_RejectType, ServerConfig, ServerSync, UDPTunnel, UserState, Version};
use crate::proto::{expected_message, message_to_bytes, send_message, MessageKind};
use crate::server::constants::VOICE_TARGET_SLOTS;
use crate::sync::RwLock;
use crate::target::VoiceTarget;
use crate::voice::{encode_voice_packet, Clientbound, VoicePacket};
use bytes::BytesMut;
use protobuf::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::Sender;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;

pub type ClientRef = Arc<RwLock<Client>>;

pub struct Client {
    pub version: Version,
    pub authenticate: Authenticate,
    pub session_id: u32,
    pub channel_id: u32,
    pub mute: bool,
    pub deaf: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub comment: Option<String>,
    pub dead: bool,
    pub remote_address: SocketAddr,
    pub connected_at: Instant,
    pub write: RwLock<WriteHalf<TlsStream<TcpStream>>>,
    pub crypt_state: Arc<RwLock<CryptState>>,
    pub udp_socket_addr: Option<SocketAddr>,
    pub use_opus: bool,
    pub codecs: Vec<i32>,
    pub udp_socket: Arc<UdpSocket>,
    pub publisher: Sender<ClientMessage>,
    pub targets: Vec<VoiceTarget>,
    pub last_ping: Instant,
}

impl Client {
    /// Drives the handshake on a fresh TLS stream: the peer must send Version
    /// first, then Authenticate. Any other ordering fails the handshake and
    /// the connection never reaches the roster.
    pub async fn init(
        stream: &mut TlsStream<TcpStream>,
        server_version: Version,
    ) -> Result<(Version, Authenticate, CryptState), MumbleError> {
        let version: Version = expected_message(MessageKind::Version, stream, 0).await?;

        // Send version
        send_message(MessageKind::Version, &server_version, stream).await?;

        // Get authenticate
        let authenticate: Authenticate = expected_message(MessageKind::Authenticate, stream, 0).await?;

        if authenticate.get_username().is_empty() {
            return Err(MumbleError::MissingUsername);
        }

        let crypt = CryptState::generate()?;
        let crypt_setup = crypt.get_crypt_setup();

        // Send crypt setup
        send_message(MessageKind::CryptSetup, &crypt_setup, stream).await?;

        Ok((version, authenticate, crypt))
    }

    /// Sends a Reject on a stream that never completed the handshake.
    pub async fn reject(
        stream: &mut TlsStream<TcpStream>,
        reject_type: Reject_RejectType,
        reason: &str,
    ) -> Result<(), MumbleError> {
        let mut reject = Reject::new();
        reject.set_field_type(reject_type);
        reject.set_reason(reason.to_string());

        send_message(MessageKind::Reject, &reject, stream).await
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: Version,
        authenticate: Authenticate,
        session_id: u32,
        channel_id: u32,
        crypt_state: CryptState,
        write: WriteHalf<TlsStream<TcpStream>>,
        remote_address: SocketAddr,
        udp_socket: Arc<UdpSocket>,
        publisher: Sender<ClientMessage>,
    ) -> Self {
        let mut targets = Vec::with_capacity(VOICE_TARGET_SLOTS);
        targets.resize_with(VOICE_TARGET_SLOTS, Default::default);

        Self {
            version,
            session_id,
            channel_id,
            crypt_state: Arc::new(RwLock::new(crypt_state)),
            write: RwLock::new(write),
            deaf: false,
            mute: false,
            self_mute: false,
            self_deaf: false,
            comment: None,
            dead: false,
            remote_address,
            connected_at: Instant::now(),
            udp_socket_addr: None,
            use_opus: if authenticate.has_opus() { authenticate.get_opus() } else { false },
            codecs: authenticate.get_celt_versions().to_vec(),
            authenticate,
            udp_socket,
            publisher,
            targets,
            last_ping: Instant::now(),
        }
    }

    pub fn username(&self) -> &str {
        self.authenticate.get_username()
    }

    /// Whisper slot for an audio target byte in 1..=30.
    pub fn get_target(&self, id: usize) -> Option<&VoiceTarget> {
        if id == 0 {
            return None;
        }

        self.targets.get(id - 1)
    }

    pub fn get_target_mut(&mut self, id: usize) -> Option<&mut VoiceTarget> {
        if id == 0 {
            return None;
        }

        self.targets.get_mut(id - 1)
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), MumbleError> {
        match timeout(Duration::from_secs(1), async {
            let mut write = self.write.write_err().await?;
            write.write_all(data).await?;
            write.flush().await?;

            Ok::<(), MumbleError>(())
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MumbleError::Timeout),
        }
    }

    pub async fn send_message<T: Message>(&self, kind: MessageKind, message: &T) -> Result<(), MumbleError> {
        tracing::trace!(
            "[{}] [{}] send message: {:?}, {:?}",
            self.username(),
            self.session_id,
            std::any::type_name::<T>(),
            message
        );

        let bytes = message_to_bytes(kind, message)?;

        self.send(bytes.as_ref()).await?;

        crate::metrics::MESSAGES_TOTAL
            .with_label_values(&["tcp", "output", kind.to_string().as_str()])
            .inc();

        crate::metrics::MESSAGES_BYTES
            .with_label_values(&["tcp", "output", kind.to_string().as_str()])
            .inc_by(bytes.len() as u64);

        Ok(())
    }

    /// Queues a pre-serialized frame on the writer task without blocking. A
    /// full queue drops the frame for this client only.
    pub fn enqueue_message(&self, kind: MessageKind, payload: bytes::Bytes) {
        if self.dead {
            return;
        }

        match self.publisher.try_send(ClientMessage::SendMessage { kind, payload }) {
            Ok(_) => {}
            Err(err) => {
                tracing::error!("failed to queue message for {}: {}", self.username(), err);
            }
        }
    }

    pub async fn send_crypt_setup(&self, reset: bool) -> Result<(), MumbleError> {
        if reset {
            {
                self.crypt_state.write_err().await?.reset()?;
            }
        }

        let crypt_setup = { self.crypt_state.read_err().await?.get_crypt_setup() };

        self.send_message(MessageKind::CryptSetup, &crypt_setup).await
    }

    pub async fn send_server_sync(&self, max_bandwidth: u32, welcome_text: &str) -> Result<(), MumbleError> {
        let mut server_sync = ServerSync::default();
        server_sync.set_max_bandwidth(max_bandwidth);
        server_sync.set_session(self.session_id);
        server_sync.set_welcome_text(welcome_text.to_string());

        self.send_message(MessageKind::ServerSync, &server_sync).await
    }

    pub async fn send_server_config(&self, max_bandwidth: u32, max_users: u32) -> Result<(), MumbleError> {
        let mut server_config = ServerConfig::default();
        server_config.set_max_bandwidth(max_bandwidth);
        server_config.set_max_users(max_users);
        server_config.set_allow_html(true);
        server_config.set_message_length(1000);
        server_config.set_image_message_length(1000);

        self.send_message(MessageKind::ServerConfig, &server_config).await
    }

    /// Ships one voice packet over the learned UDP path, falling back to a
    /// tunneled control frame when no UDP peer is known yet.
    pub async fn send_voice_packet(&self, packet: &VoicePacket<Clientbound>) -> Result<(), MumbleError> {
        let mut data = BytesMut::new();
        encode_voice_packet(packet, &mut data);

        if let Some(addr) = self.udp_socket_addr {
            let mut dest = BytesMut::new();
            self.crypt_state.write_err().await?.encrypt(&data, &mut dest);

            let buf = &dest.freeze()[..];

            match timeout(Duration::from_secs(1), self.udp_socket.send_to(buf, addr)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(MumbleError::Io(e)),
                Err(_) => Err(MumbleError::Timeout),
            }?;

            crate::metrics::MESSAGES_TOTAL
                .with_label_values(&["udp", "output", "VoicePacket"])
                .inc();

            crate::metrics::MESSAGES_BYTES
                .with_label_values(&["udp", "output", "VoicePacket"])
                .inc_by(buf.len() as u64);

            return Ok(());
        }

        let mut tunnel_message = UDPTunnel::default();
        tunnel_message.set_packet(data.freeze().to_vec());

        self.send_message(MessageKind::UDPTunnel, &tunnel_message).await
    }

    /// Applies the fields a client may set on itself.
    pub fn update(&mut self, state: &UserState) {
        if state.has_mute() {
            self.mute = state.get_mute();
        }

        if state.has_deaf() {
            self.deaf = state.get_deaf();
        }

        if state.has_self_mute() {
            self.self_mute = state.get_self_mute();
        }

        if state.has_self_deaf() {
            self.self_deaf = state.get_self_deaf();
        }

        if state.has_comment() {
            self.comment = Some(state.get_comment().to_string());
        }
    }

    pub fn join_channel(&mut self, mut channel_id: u32) -> Option<u32> {
        if channel_id == self.channel_id {
            return None;
        }

        std::mem::swap(&mut self.channel_id, &mut channel_id);

        Some(channel_id)
    }

    pub fn get_user_state(&self) -> UserState {
        let mut user_state = UserState::new();

        user_state.set_user_id(self.session_id);
        user_state.set_channel_id(self.channel_id);
        user_state.set_session(self.session_id);
        user_state.set_name(self.username().to_string());

        if self.mute {
            user_state.set_mute(true);
        }

        if self.deaf {
            user_state.set_deaf(true);
        }

        if self.self_mute {
            user_state.set_self_mute(true);
        }

        if self.self_deaf {
            user_state.set_self_deaf(true);
        }

        if let Some(comment) = &self.comment {
            user_state.set_comment(comment.clone());
        }

        user_state
    }

    /// True once the peer can no longer hear anything, used to skip voice
    /// fan-out work.
    pub fn is_deafened(&self) -> bool {
        self.deaf || self.self_deaf
    }
}
