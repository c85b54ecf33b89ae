use crate::client::{Client, ClientRef};
use crate::error::MumbleError;
use crate::message::ClientMessage;
use crate::proto::mumble::{Reject_RejectType, Version};
use crate::proto::{read_frame, MessageKind};
use crate::server::constants::CLIENT_QUEUE_CAPACITY;
use crate::state::ServerState;
use crate::sync::RwLock;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{self, AsyncWriteExt, ReadHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Depth of the server-wide dispatch queue all readers feed into.
const DISPATCH_QUEUE_CAPACITY: usize = 1024;

/// One control frame on its way to the dispatcher.
struct DispatchMessage {
    client: ClientRef,
    kind: MessageKind,
    payload: BytesMut,
}

pub fn create_tcp_server(
    tcp_listener: TcpListener,
    acceptor: TlsAcceptor,
    server_version: Version,
    state: Arc<RwLock<ServerState>>,
) -> JoinHandle<()> {
    actix_rt::spawn(async move {
        let (dispatch_sender, dispatch_receiver) = mpsc::channel::<DispatchMessage>(DISPATCH_QUEUE_CAPACITY);

        {
            let state = state.clone();

            actix_rt::spawn(async move {
                dispatch_run(state, dispatch_receiver).await;
            });
        }

        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let acceptor = acceptor.clone();
                    let server_version = server_version.clone();
                    let state = state.clone();
                    let dispatch_sender = dispatch_sender.clone();

                    actix_rt::spawn(async move {
                        if let Err(err) = handle_connection(stream, addr, acceptor, server_version, state, dispatch_sender).await
                        {
                            tracing::warn!("connection from {} closed: {}", addr, err);
                        }
                    });
                }
                Err(err) => {
                    tracing::error!("failed to accept tcp connection: {}", err);
                }
            }
        }
    })
}

/// Lifecycle of one TLS connection: handshake, admission, sync, then the
/// read loop until the peer goes away.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    server_version: Version,
    state: Arc<RwLock<ServerState>>,
    dispatch_sender: Sender<DispatchMessage>,
) -> Result<(), MumbleError> {
    // The TLS handshake completes here; a failure never reaches the roster.
    let mut stream = acceptor.accept(stream).await?;

    tracing::info!("new connection from {}", addr);

    let (version, authenticate, crypt_state) = match Client::init(&mut stream, server_version).await {
        Ok(parts) => parts,
        Err(err) => {
            if matches!(err, MumbleError::MissingUsername) {
                let _ = Client::reject(&mut stream, Reject_RejectType::InvalidUsername, "a username is required").await;
            }

            let _ = stream.shutdown().await;
            return Err(err);
        }
    };

    {
        let state_read = state.read_err().await?;

        if state_read.is_full() {
            drop(state_read);

            let _ = Client::reject(&mut stream, Reject_RejectType::ServerFull, "server is full").await;
            let _ = stream.shutdown().await;

            return Err(MumbleError::ServerFull);
        }
    }

    let username = authenticate.get_username().to_string();
    let (read, write) = io::split(stream);
    let (publisher, consumer) = mpsc::channel::<ClientMessage>(CLIENT_QUEUE_CAPACITY);

    let client = {
        let mut state_write = state.write_err().await?;
        state_write.add_client(version, authenticate, crypt_state, write, addr, publisher)
    };

    let session_id = { client.read_err().await?.session_id };

    match sync_new_client(&state, &client).await {
        Ok(()) => {}
        Err(err) => {
            let mut state_write = state.write_err().await?;
            state_write.disconnect(&client).await?;

            return Err(err);
        }
    }

    tracing::info!("client {} authenticated with session {}", username, session_id);

    {
        let client = client.clone();

        actix_rt::spawn(async move {
            writer_run(client, consumer).await;
        });
    }

    let result = reader_run(read, client.clone(), dispatch_sender).await;

    tracing::info!("client {} with session {} disconnected", username, session_id);

    {
        let mut state_write = state.write_err().await?;
        state_write.disconnect(&client).await?;
    }

    result
}

/// Post-admission sequence for a fresh client: codec election, channel tree,
/// announcement, roster snapshot, then ServerSync/ServerConfig. Everything
/// the new client must see in order is written directly on its stream (its
/// writer task has not started draining the queue yet): channels first, the
/// roster snapshot containing its own state, ServerSync last. The announce
/// broadcast therefore excludes the new client itself.
async fn sync_new_client(state: &Arc<RwLock<ServerState>>, client: &ClientRef) -> Result<(), MumbleError> {
    {
        let mut state_write = state.write_err().await?;
        state_write.check_codec().await?;
    }

    let (channel_states, user_states) = {
        let state_read = state.read_err().await?;
        state_read.collect_sync().await?
    };

    {
        let client_read = client.read_err().await?;

        for channel_state in &channel_states {
            client_read.send_message(MessageKind::ChannelState, channel_state).await?;
        }
    }

    let (session_id, user_state) = {
        let client_read = client.read_err().await?;
        (client_read.session_id, client_read.get_user_state())
    };

    {
        let state_read = state.read_err().await?;
        state_read
            .broadcast_message_except(MessageKind::UserState, &user_state, session_id)
            .await?;
    }

    let (max_bandwidth, max_users, welcome_text) = {
        let state_read = state.read_err().await?;
        (
            state_read.settings.max_bandwidth,
            state_read.settings.max_users,
            state_read.settings.welcome_text.clone(),
        )
    };

    {
        let client_read = client.read_err().await?;

        for user_state in &user_states {
            client_read.send_message(MessageKind::UserState, user_state).await?;
        }

        client_read.send_server_sync(max_bandwidth, &welcome_text).await?;
        client_read.send_server_config(max_bandwidth, max_users).await?;
    }

    Ok(())
}

/// Parses frames off the TLS stream and feeds the dispatcher. Any framing
/// error, unknown kind, or closed queue ends the connection.
async fn reader_run(
    mut read: ReadHalf<TlsStream<TcpStream>>,
    client: ClientRef,
    dispatch_sender: Sender<DispatchMessage>,
) -> Result<(), MumbleError> {
    loop {
        let (raw_kind, payload) = read_frame(&mut read).await?;
        let kind = MessageKind::try_from(raw_kind)?;

        if client.read_err().await?.dead {
            return Ok(());
        }

        let message = DispatchMessage {
            client: client.clone(),
            kind,
            payload,
        };

        if dispatch_sender.send(message).await.is_err() {
            return Err(MumbleError::QueueClosed);
        }
    }
}

/// Single consumer of all clients' control messages: one frame at a time, in
/// arrival order, so every state mutation is totally ordered. An error while
/// handling a frame kills its sender and nobody else.
async fn dispatch_run(state: Arc<RwLock<ServerState>>, mut receiver: Receiver<DispatchMessage>) {
    while let Some(message) = receiver.recv().await {
        let dead = match message.client.read_err().await {
            Ok(client_read) => client_read.dead,
            Err(_) => true,
        };

        if dead {
            continue;
        }

        if let Err(err) = crate::handler::handle_message(&state, &message.client, message.kind, message.payload).await {
            let username = match message.client.read_err().await {
                Ok(client_read) => client_read.username().to_string(),
                Err(_) => "<unknown>".to_string(),
            };

            tracing::warn!("error handling {} from {}: {}", message.kind, username, err);

            if let Ok(mut state_write) = state.write_err().await {
                if let Err(err) = state_write.disconnect(&message.client).await {
                    tracing::error!("failed to disconnect {}: {}", username, err);
                }
            }
        }
    }
}

/// Consumes one client's outbound queue. A write failure flags the client
/// dead and stops consuming; the roster reaps it from the reader side.
async fn writer_run(client: ClientRef, mut consumer: Receiver<ClientMessage>) {
    while let Some(message) = consumer.recv().await {
        let result = match message {
            ClientMessage::SendMessage { kind, payload } => {
                let send_result = match client.read_err().await {
                    Ok(client_read) => client_read.send(&payload).await,
                    Err(err) => Err(err),
                };

                if send_result.is_ok() {
                    crate::metrics::MESSAGES_TOTAL
                        .with_label_values(&["tcp", "output", kind.to_string().as_str()])
                        .inc();

                    crate::metrics::MESSAGES_BYTES
                        .with_label_values(&["tcp", "output", kind.to_string().as_str()])
                        .inc_by(payload.len() as u64);
                }

                send_result
            }
            ClientMessage::SendVoicePacket(packet) => match client.read_err().await {
                Ok(client_read) => client_read.send_voice_packet(&packet).await,
                Err(err) => Err(err),
            },
            ClientMessage::Disconnect => break,
        };

        if let Err(err) = result {
            if let Ok(mut client_write) = client.write_err().await {
                tracing::warn!("write to {} failed, dropping queue: {}", client_write.username(), err);
                client_write.dead = true;
            }

            break;
        }
    }
}
