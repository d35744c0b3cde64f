//! Embedding entry point.
//!
//! [`Client::start`] spawns the network thread, which runs the engine and
//! the core dispatcher side by side on one current-thread tokio runtime.
//! Everything else talks to them through a cloneable [`ClientHandle`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use rslsk::client::Client;
//! use rslsk::collaborator::{BanList, StaticShares};
//! use rslsk::config::Config;
//! use rslsk::dispatch::{Collaborators, CoreEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?;
//! let collaborators = Collaborators {
//!     shares: Arc::new(StaticShares::new()),
//!     permissions: Arc::new(BanList::new()),
//!     store: None,
//! };
//! let client = Client::start(config, collaborators)?;
//! let handle = client.handle();
//! let mut events = handle.subscribe();
//! handle.connect()?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let CoreEvent::LoggedIn { .. } = event {
//!         handle.download("bob", "music\\song.flac", 4_000_000)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use crate::collaborator::{JsonTransferStore, TransferStore};
use crate::config::{Config, TransferConfig};
use crate::dispatch::{Collaborators, Core, CoreCommand, CoreEvent};
use crate::net::{ConnectionStats, NetworkEngine};
use crate::protocol::PeerMessage;

/// Errors raised by [`Client`] and [`ClientHandle`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The listener, runtime or network thread could not be created.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The network thread is gone.
    #[error("client stopped")]
    Stopped,

    /// The network thread panicked.
    #[error("network thread panicked")]
    Panicked,
}

/// A running client. Dropping it shuts the network thread down.
pub struct Client {
    handle: ClientHandle,
    thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Client {
    /// Binds the listen port and starts the network thread.
    ///
    /// Transfer lists are persisted in `config.state_dir` unless the
    /// collaborators bring their own store.
    pub fn start(config: Config, mut collaborators: Collaborators) -> Result<Self, ClientError> {
        if collaborators.store.is_none() {
            if let Some(dir) = &config.state_dir {
                let store: Arc<dyn TransferStore + Sync> = Arc::new(JsonTransferStore::new(dir));
                collaborators.store = Some(store);
            }
        }

        let runtime = Builder::new_current_thread().enable_all().build()?;

        let listen = (Ipv4Addr::UNSPECIFIED, config.network.listen_port);
        let listener = std::net::TcpListener::bind(listen)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr().ok();
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };

        let (engine, net, net_events) = NetworkEngine::new(&config.network, Some(listener));
        let core = Core::new(config, collaborators);
        let events = core.event_sender();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name("rslsk-network".into())
            .spawn({
                let net = net.clone();
                move || {
                    runtime.block_on(async move {
                        tokio::join!(engine.run(), core.run(net, net_events, command_rx));
                    });
                }
            })?;

        info!(addr = ?local_addr, "client started");
        Ok(Self {
            handle: ClientHandle {
                commands,
                events,
                net,
            },
            thread: Some(thread),
            local_addr,
        })
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Address peers connect to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Saves transfer lists, closes every connection and waits for the
    /// network thread to finish.
    pub fn shutdown(mut self) -> Result<(), ClientError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ClientError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        // The core may already be gone, joining is still right
        let _ = self.handle.commands.send(CoreCommand::Shutdown);
        thread.join().map_err(|_| ClientError::Panicked)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "client did not stop cleanly");
        }
    }
}

/// Cloneable access to a running [`Client`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<CoreCommand>,
    events: broadcast::Sender<CoreEvent>,
    net: crate::net::NetHandle,
}

impl ClientHandle {
    pub fn send(&self, command: CoreCommand) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Latest connection statistics.
    pub fn stats(&self) -> ConnectionStats {
        self.net.stats()
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.send(CoreCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send(CoreCommand::Disconnect)
    }

    /// Downloads into the configured download folder.
    pub fn download(&self, user: &str, virtual_path: &str, size: u64) -> Result<(), ClientError> {
        self.download_to(user, virtual_path, None, size)
    }

    pub fn download_to(
        &self,
        user: &str,
        virtual_path: &str,
        folder: Option<PathBuf>,
        size: u64,
    ) -> Result<(), ClientError> {
        self.send(CoreCommand::Download {
            user: user.to_string(),
            virtual_path: virtual_path.to_string(),
            folder,
            size,
        })
    }

    pub fn push_upload(&self, user: &str, virtual_path: &str) -> Result<(), ClientError> {
        self.send(CoreCommand::PushUpload {
            user: user.to_string(),
            virtual_path: virtual_path.to_string(),
            size: None,
        })
    }

    pub fn abort_download(&self, user: &str, virtual_path: &str) -> Result<(), ClientError> {
        self.send(CoreCommand::AbortDownload {
            user: user.to_string(),
            virtual_path: virtual_path.to_string(),
        })
    }

    pub fn retry_download(&self, user: &str, virtual_path: &str) -> Result<(), ClientError> {
        self.send(CoreCommand::RetryDownload {
            user: user.to_string(),
            virtual_path: virtual_path.to_string(),
        })
    }

    pub fn abort_upload(&self, user: &str, virtual_path: &str) -> Result<(), ClientError> {
        self.send(CoreCommand::AbortUpload {
            user: user.to_string(),
            virtual_path: virtual_path.to_string(),
        })
    }

    pub fn retry_upload(&self, user: &str, virtual_path: &str) -> Result<(), ClientError> {
        self.send(CoreCommand::RetryUpload {
            user: user.to_string(),
            virtual_path: virtual_path.to_string(),
        })
    }

    /// Starts a network-wide search and returns its token.
    pub async fn search(&self, query: &str) -> Result<u32, ClientError> {
        let (reply, token) = oneshot::channel();
        self.send(CoreCommand::Search {
            query: query.to_string(),
            reply,
        })?;
        token.await.map_err(|_| ClientError::Stopped)
    }

    pub async fn user_search(&self, user: &str, query: &str) -> Result<u32, ClientError> {
        let (reply, token) = oneshot::channel();
        self.send(CoreCommand::UserSearch {
            user: user.to_string(),
            query: query.to_string(),
            reply,
        })?;
        token.await.map_err(|_| ClientError::Stopped)
    }

    /// Asks `user` for one folder. The answer arrives as [`CoreEvent::FolderContents`].
    pub async fn browse_folder(&self, user: &str, folder: &str) -> Result<u32, ClientError> {
        let (reply, token) = oneshot::channel();
        self.send(CoreCommand::BrowseFolder {
            user: user.to_string(),
            folder: folder.to_string(),
            reply,
        })?;
        token.await.map_err(|_| ClientError::Stopped)
    }

    pub fn browse_shares(&self, user: &str) -> Result<(), ClientError> {
        self.send(CoreCommand::GetSharedFileList {
            user: user.to_string(),
        })
    }

    pub fn user_info(&self, user: &str) -> Result<(), ClientError> {
        self.send(CoreCommand::GetUserInfo {
            user: user.to_string(),
        })
    }

    pub fn watch_user(&self, user: &str) -> Result<(), ClientError> {
        self.send(CoreCommand::WatchUser {
            user: user.to_string(),
        })
    }

    pub fn send_peer(&self, user: &str, message: PeerMessage) -> Result<(), ClientError> {
        self.send(CoreCommand::SendPeer {
            user: user.to_string(),
            message,
        })
    }

    pub fn set_download_filters(&self, patterns: Vec<String>) -> Result<(), ClientError> {
        self.send(CoreCommand::SetDownloadFilters(patterns))
    }

    pub fn update_transfer_config(&self, config: TransferConfig) -> Result<(), ClientError> {
        self.send(CoreCommand::UpdateTransferConfig(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{BanList, StaticShares};
    use crate::protocol::{LoginReply, ServerResponse};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn collaborators() -> Collaborators {
        Collaborators {
            shares: Arc::new(StaticShares::new()),
            permissions: Arc::new(BanList::new()),
            store: None,
        }
    }

    #[tokio::test]
    async fn test_client_logs_in_to_server() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut config = Config::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = server_addr.port();
        config.server.username = "alice".into();
        config.server.password = "secret".into();
        config.network.listen_port = 0;

        let client = Client::start(config, collaborators()).unwrap();
        assert!(client.local_addr().is_some());
        let handle = client.handle();
        let mut events = handle.subscribe();
        handle.connect().unwrap();

        let (mut socket, _) = timeout(Duration::from_secs(5), server.accept())
            .await
            .unwrap()
            .unwrap();
        let mut login = [0u8; 8];
        socket.read_exact(&mut login).await.unwrap();
        assert_eq!(u32::from_le_bytes([login[4], login[5], login[6], login[7]]), 1);

        let reply = ServerResponse::Login(LoginReply::Success {
            greeting: "hi".into(),
            own_ip: Ipv4Addr::LOCALHOST,
            password_hash: None,
        });
        socket.write_all(&reply.encode()).await.unwrap();

        let logged_in = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(CoreEvent::LoggedIn { username, .. }) => return username,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel failed: {}", e),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(logged_in, "alice");

        client.shutdown().unwrap();
        assert!(handle.connect().is_err());
    }

    #[tokio::test]
    async fn test_search_token_comes_back() {
        let mut config = Config::default();
        config.network.listen_port = 0;
        let client = Client::start(config, collaborators()).unwrap();
        let handle = client.handle();

        let first = handle.search("flac").await.unwrap();
        let second = handle.search("mp3").await.unwrap();
        assert_ne!(first, second);
        client.shutdown().unwrap();
    }
}
