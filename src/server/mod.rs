pub mod constants;
mod tcp;
mod udp;

pub use tcp::create_tcp_server;
pub use udp::create_udp_server;
