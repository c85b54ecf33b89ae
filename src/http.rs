use crate::state::ServerState;
use crate::sync::RwLock;
use actix_web::dev::ServiceRequest;
use actix_web::{web, App, HttpResponse, HttpServer};
use actix_web_httpauth::extractors::basic::BasicAuth;
use actix_web_httpauth::middleware::HttpAuthentication;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

struct HttpCredentials {
    user: String,
    password: String,
}

#[derive(Serialize)]
struct ClientEntry {
    session: u32,
    name: String,
    channel: u32,
    mute: bool,
    deaf: bool,
    udp: bool,
}

#[derive(Serialize)]
struct ChannelEntry {
    id: u32,
    parent: Option<u32>,
    name: String,
    temporary: bool,
}

async fn validator(
    req: ServiceRequest,
    credentials: BasicAuth,
) -> Result<ServiceRequest, (actix_web::Error, ServiceRequest)> {
    let expected = match req.app_data::<web::Data<HttpCredentials>>() {
        Some(expected) => expected,
        None => return Err((actix_web::error::ErrorUnauthorized("invalid credentials"), req)),
    };

    let password_matches = credentials
        .password()
        .map(|password| password == expected.password.as_str())
        .unwrap_or(false);

    if credentials.user_id() == expected.user.as_str() && password_matches {
        return Ok(req);
    }

    Err((actix_web::error::ErrorUnauthorized("invalid credentials"), req))
}

async fn get_clients(state: web::Data<Arc<RwLock<ServerState>>>) -> HttpResponse {
    let state_read = match state.read_err().await {
        Ok(state_read) => state_read,
        Err(_) => return HttpResponse::ServiceUnavailable().finish(),
    };

    let mut entries = Vec::with_capacity(state_read.clients.len());

    for client in state_read.clients.values() {
        if let Ok(client_read) = client.read_err().await {
            entries.push(ClientEntry {
                session: client_read.session_id,
                name: client_read.username().to_string(),
                channel: client_read.channel_id,
                mute: client_read.mute || client_read.self_mute,
                deaf: client_read.is_deafened(),
                udp: client_read.udp_socket_addr.is_some(),
            });
        }
    }

    HttpResponse::Ok().json(entries)
}

async fn get_channels(state: web::Data<Arc<RwLock<ServerState>>>) -> HttpResponse {
    let state_read = match state.read_err().await {
        Ok(state_read) => state_read,
        Err(_) => return HttpResponse::ServiceUnavailable().finish(),
    };

    let entries: Vec<ChannelEntry> = state_read
        .channels
        .values()
        .map(|channel| ChannelEntry {
            id: channel.id,
            parent: channel.parent,
            name: channel.name.clone(),
            temporary: channel.temporary,
        })
        .collect();

    HttpResponse::Ok().json(entries)
}

async fn kick_client(session: web::Path<u32>, state: web::Data<Arc<RwLock<ServerState>>>) -> HttpResponse {
    let client = {
        let state_read = match state.read_err().await {
            Ok(state_read) => state_read,
            Err(_) => return HttpResponse::ServiceUnavailable().finish(),
        };

        state_read.get_client_by_session(*session)
    };

    let client = match client {
        Some(client) => client,
        None => return HttpResponse::NotFound().finish(),
    };

    match state.write_err().await {
        Ok(mut state_write) => match state_write.disconnect(&client).await {
            Ok(()) => HttpResponse::Ok().finish(),
            Err(_) => HttpResponse::InternalServerError().finish(),
        },
        Err(_) => HttpResponse::ServiceUnavailable().finish(),
    }
}

async fn get_metrics() -> HttpResponse {
    match prometheus::TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(body) => HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(body),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

pub fn create_http_server(
    http_listen: String,
    tls_config: rustls::ServerConfig,
    https: bool,
    state: Arc<RwLock<ServerState>>,
    http_user: String,
    http_password: String,
) -> Option<JoinHandle<()>> {
    let state = web::Data::new(state);
    let credentials = web::Data::new(HttpCredentials {
        user: http_user,
        password: http_password,
    });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(credentials.clone())
            .wrap(HttpAuthentication::basic(validator))
            .route("/metrics", web::get().to(get_metrics))
            .service(
                web::scope("/api")
                    .route("/clients", web::get().to(get_clients))
                    .route("/clients/{session}", web::delete().to(kick_client))
                    .route("/channels", web::get().to(get_channels)),
            )
    });

    let bound = if https {
        server.bind_rustls(http_listen.as_str(), tls_config)
    } else {
        server.bind(http_listen.as_str())
    };

    match bound {
        Ok(server) => Some(actix_rt::spawn(async move {
            if let Err(err) = server.run().await {
                tracing::error!("http server error: {}", err);
            }
        })),
        Err(err) => {
            tracing::error!("cannot bind http server on {}: {}", http_listen, err);
            None
        }
    }
}
