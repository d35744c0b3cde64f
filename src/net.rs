//! Socket multiplexer and peer connection management.
//!
//! The network layer is split into socket-free state and the engine that owns
//! the sockets:
//!
//! - [`Connection`]: buffers, role and handshake of one socket
//! - `PeerRouter`: direct and indirect connection establishment
//! - [`UploadShaper`]: upload and download rate limiting
//! - [`NetworkEngine`]: the loop that owns every socket
//!
//! Other components talk to the engine through a [`NetHandle`] by sending
//! [`NetCommand`]s, and receive [`NetEvent`]s in return.
//!
//! # Example
//!
//! ```no_run
//! use rslsk::config::NetworkConfig;
//! use rslsk::net::{NetCommand, NetEvent, NetworkEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (engine, handle, mut events) = NetworkEngine::new(&NetworkConfig::default(), None);
//! tokio::spawn(engine.run());
//!
//! handle.send(NetCommand::ConnectServer {
//!     addr: "127.0.0.1:2242".parse()?,
//!     username: "alice".into(),
//!     password: "secret".into(),
//!     listen_port: 2234,
//! })?;
//!
//! while let Some(event) = events.recv().await {
//!     if let NetEvent::ServerConnected { addr } = event {
//!         println!("connected to {}", addr);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod connection;
mod engine;
mod error;
mod event;
mod router;
mod shaper;

pub use connection::{ConnId, Connection, ConnectionRole, HandshakeState};
pub use engine::{NetHandle, NetworkEngine};
pub use error::NetError;
pub use event::{CloseReason, ConnectionStats, NetCommand, NetEvent};
pub use shaper::{DownloadLimiter, RateMeter, ShapingPolicy, UploadShaper};

#[cfg(test)]
mod tests;
