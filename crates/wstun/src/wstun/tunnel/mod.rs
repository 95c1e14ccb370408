pub mod address;
pub mod conn;
pub mod datagram;
pub mod direct;
pub mod frame;
pub mod handshake;
pub mod mux;
pub mod outbound;
pub mod resolver;
pub mod server;
pub mod session;
