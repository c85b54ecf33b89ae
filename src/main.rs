#[macro_use]
extern crate lazy_static;

mod channel;
mod check;
mod client;
mod crypt;
mod error;
mod handler;
mod http;
mod message;
mod metrics;
mod proto;
mod server;
mod state;
mod sync;
mod target;
mod varint;
mod voice;

use crate::check::check_loop;
use crate::http::create_http_server;
use crate::proto::mumble::Version;
use crate::server::constants::PROTOCOL_VERSION;
use crate::server::{create_tcp_server, create_udp_server};
use crate::state::{ServerSettings, ServerState};
use crate::sync::RwLock;
use clap::Parser;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::rustls::{self, Certificate, PrivateKey};
use tokio_rustls::TlsAcceptor;

/// Mumbled, a mumble voice chat server
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Address the voice protocol binds to, TCP and UDP on the same port
    #[clap(short, long, value_parser, default_value = "0.0.0.0:64738")]
    listen: String,
    /// Address the admin HTTP api binds to
    #[clap(short = 'a', long, value_parser, default_value = "0.0.0.0:8080")]
    http_listen: String,
    /// Basic auth user for the admin api
    #[clap(long, value_parser, default_value = "admin")]
    http_user: String,
    /// Basic auth password for the admin api
    #[clap(long, value_parser)]
    http_password: String,
    /// Serve the admin api over https, reusing the voice certificate
    #[clap(long)]
    https: bool,
    /// PEM file holding the server private key
    #[clap(long, value_parser, default_value = "key.pem")]
    key: String,
    /// PEM file holding the server certificate chain
    #[clap(long, value_parser, default_value = "cert.pem")]
    cert: String,
    /// Maximum number of simultaneous users
    #[clap(long, value_parser, default_value_t = 10)]
    max_users: u32,
    /// Maximum voice bandwidth per client in bits per second
    #[clap(long, value_parser, default_value_t = 300000)]
    max_bandwidth: u32,
    /// Welcome text sent to every client on connect
    #[clap(long, value_parser, default_value = "Welcome to mumbled")]
    welcome_text: String,
}

fn load_certs<P: AsRef<Path>>(path: P) -> io::Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);

    let raw = certs(&mut reader).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed certificate file"))?;

    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_key<P: AsRef<Path>>(path: P) -> io::Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut keys =
        pkcs8_private_keys(&mut reader).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed key file"))?;

    if keys.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "no pkcs8 key in file"));
    }

    Ok(PrivateKey(keys.remove(0)))
}

fn build_tls_config(args: &Args) -> io::Result<rustls::ServerConfig> {
    let certs = load_certs(args.cert.as_str())?;
    let key = load_key(args.key.as_str())?;

    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[actix_web_codegen::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = match build_tls_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("cannot set up tls from {} / {}: {}", args.cert, args.key, e);
            return;
        }
    };

    let acceptor = TlsAcceptor::from(Arc::new(config.clone()));

    tracing::info!("server start listening on {}", args.listen);

    let mut server_version = Version::new();
    server_version.set_os(std::env::consts::FAMILY.to_string());
    server_version.set_os_version(std::env::consts::OS.to_string());
    server_version.set_release(VERSION.to_string());
    server_version.set_version(PROTOCOL_VERSION);

    let udp_socket = Arc::new(match UdpSocket::bind(&args.listen).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!("cannot bind udp socket on {}: {}", args.listen, e);
            return;
        }
    });

    let settings = ServerSettings {
        max_users: args.max_users,
        max_bandwidth: args.max_bandwidth,
        welcome_text: args.welcome_text.clone(),
    };

    let state = Arc::new(RwLock::new(ServerState::new(udp_socket.clone(), settings)));
    let udp_state = state.clone();

    actix_rt::spawn(async move {
        create_udp_server(PROTOCOL_VERSION, udp_socket, udp_state).await;
    });

    let check_state = state.clone();

    actix_rt::spawn(async move {
        check_loop(check_state).await;
    });

    let tcp_listener = match TcpListener::bind(args.listen.clone()).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot bind tcp listener on {}: {}", args.listen, e);
            return;
        }
    };

    let mut waiting_list = Vec::new();

    waiting_list.push(create_tcp_server(tcp_listener, acceptor, server_version, state.clone()));

    let http_server = create_http_server(
        args.http_listen,
        config,
        args.https,
        state.clone(),
        args.http_user,
        args.http_password,
    );

    if let Some(http_server) = http_server {
        waiting_list.push(http_server);
    }

    if let Err(e) = futures::future::try_join_all(waiting_list).await {
        tracing::error!("server error: {}", e);
    }
}
