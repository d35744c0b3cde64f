//! Peer connection establishment.
//!
//! Soulseek peers reach each other in two ways at once: we connect directly
//! to the address the server reports, and we ask the server to relay a
//! ConnectToPeer request so the peer can connect back to us. Whichever socket
//! shows up first carries the messages queued for that user.
//!
//! [`PeerRouter`] does the bookkeeping without touching sockets. Each call
//! returns [`Action`]s for the engine to carry out.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use tracing::{debug, info};

use super::connection::ConnId;
use super::event::NetEvent;
use crate::constants::INDIRECT_REQUEST_TIMEOUT;
use crate::protocol::{ConnectionType, PeerInit, PeerMessage, ServerRequest, TextEncoding};
use crate::token::TokenSequence;

/// Why an outbound peer socket is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectIntent {
    /// Direct attempt for the pending init with this token.
    Direct { token: u32 },
    /// Answer to a ConnectToPeer relayed by the server.
    Pierce {
        user: String,
        conn_type: ConnectionType,
        token: u32,
    },
}

/// Bytes the engine writes on behalf of the router.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outgoing {
    Init(PeerInit),
    Peer(PeerMessage, TextEncoding),
    FileTransferInit(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    Connect { addr: SocketAddr, intent: ConnectIntent },
    SendServer(ServerRequest),
    /// Binds an open socket to a user and connection type.
    Bind {
        conn: ConnId,
        user: String,
        conn_type: ConnectionType,
    },
    Write { conn: ConnId, out: Outgoing },
    Close(ConnId),
    Emit(NetEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Idle,
    Running,
    Failed,
}

#[derive(Debug)]
struct PendingInit {
    user: String,
    conn_type: ConnectionType,
    messages: Vec<(PeerMessage, TextEncoding)>,
    file_token: Option<u32>,
    direct: Attempt,
    indirect: Attempt,
    since: Instant,
}

impl PendingInit {
    fn is_exhausted(&self) -> bool {
        self.direct == Attempt::Failed && self.indirect == Attempt::Failed
    }
}

/// Tracks pending and live peer connections.
#[derive(Debug, Default)]
pub(crate) struct PeerRouter {
    username: String,
    tokens: TokenSequence,
    pending: HashMap<u32, PendingInit>,
    awaiting_address: HashMap<String, Vec<u32>>,
    addresses: HashMap<String, SocketAddr>,
    live: HashMap<(String, ConnectionType), ConnId>,
    bound: HashMap<ConnId, (String, ConnectionType)>,
}

impl PeerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_username(&mut self, username: &str) {
        self.username = username.to_string();
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn live_connection(&self, user: &str, conn_type: ConnectionType) -> Option<ConnId> {
        self.live.get(&(user.to_string(), conn_type)).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Routes a peer message to `user`, opening a connection when needed.
    pub fn send(
        &mut self,
        user: &str,
        message: PeerMessage,
        encoding: TextEncoding,
        now: Instant,
    ) -> Vec<Action> {
        if let Some(conn) = self.live_connection(user, ConnectionType::Peer) {
            return vec![Action::Write {
                conn,
                out: Outgoing::Peer(message, encoding),
            }];
        }

        if let Some(pending) = self
            .pending
            .values_mut()
            .find(|p| p.user == user && p.conn_type == ConnectionType::Peer)
        {
            pending.messages.push((message, encoding));
            return Vec::new();
        }

        let token = self.tokens.next_token();
        self.pending.insert(
            token,
            PendingInit {
                user: user.to_string(),
                conn_type: ConnectionType::Peer,
                messages: vec![(message, encoding)],
                file_token: None,
                direct: Attempt::Idle,
                indirect: Attempt::Idle,
                since: now,
            },
        );
        self.locate(token, now)
    }

    /// Opens a new "F" connection that announces `file_token` once open.
    pub fn open_file_connection(
        &mut self,
        user: &str,
        file_token: u32,
        now: Instant,
    ) -> Vec<Action> {
        let token = self.tokens.next_token();
        self.pending.insert(
            token,
            PendingInit {
                user: user.to_string(),
                conn_type: ConnectionType::File,
                messages: Vec::new(),
                file_token: Some(file_token),
                direct: Attempt::Idle,
                indirect: Attempt::Idle,
                since: now,
            },
        );
        self.locate(token, now)
    }

    fn locate(&mut self, token: u32, now: Instant) -> Vec<Action> {
        let Some(user) = self.pending.get(&token).map(|p| p.user.clone()) else {
            return Vec::new();
        };
        if let Some(addr) = self.addresses.get(&user).copied() {
            return self.connect(token, addr, now);
        }

        let waiting = self.awaiting_address.entry(user.clone()).or_default();
        waiting.push(token);
        if waiting.len() == 1 {
            debug!(%user, "requesting peer address");
            vec![Action::SendServer(ServerRequest::GetPeerAddress { user })]
        } else {
            Vec::new()
        }
    }

    fn connect(&mut self, token: u32, addr: SocketAddr, now: Instant) -> Vec<Action> {
        let Some(pending) = self.pending.get_mut(&token) else {
            return Vec::new();
        };
        pending.direct = Attempt::Running;
        pending.indirect = Attempt::Running;
        pending.since = now;
        debug!(user = %pending.user, %addr, token, "connecting directly and indirectly");

        vec![
            Action::Connect {
                addr,
                intent: ConnectIntent::Direct { token },
            },
            Action::SendServer(ServerRequest::ConnectToPeer {
                token,
                user: pending.user.clone(),
                conn_type: pending.conn_type,
            }),
        ]
    }

    /// Server answer to GetPeerAddress.
    pub fn on_peer_address(
        &mut self,
        user: &str,
        ip: Ipv4Addr,
        port: u32,
        now: Instant,
    ) -> Vec<Action> {
        let tokens = self.awaiting_address.remove(user).unwrap_or_default();

        if ip.is_unspecified() || port == 0 || port > u16::MAX as u32 {
            self.addresses.remove(user);
            info!(%user, "user is offline, no address");
            return tokens
                .into_iter()
                .filter_map(|token| self.fail(token, true))
                .collect();
        }

        let addr = SocketAddr::new(IpAddr::V4(ip), port as u16);
        self.addresses.insert(user.to_string(), addr);
        tokens
            .into_iter()
            .flat_map(|token| self.connect(token, addr, now))
            .collect()
    }

    /// Server relayed a peer's request that we connect to it.
    pub fn on_connect_request(
        &mut self,
        user: &str,
        conn_type: ConnectionType,
        ip: Ipv4Addr,
        port: u32,
        token: u32,
    ) -> Vec<Action> {
        if port == 0 || port > u16::MAX as u32 || ip.is_unspecified() {
            return vec![Action::SendServer(ServerRequest::CantConnectToPeer {
                token,
                user: user.to_string(),
            })];
        }
        let addr = SocketAddr::new(IpAddr::V4(ip), port as u16);
        self.addresses.insert(user.to_string(), addr);
        vec![Action::Connect {
            addr,
            intent: ConnectIntent::Pierce {
                user: user.to_string(),
                conn_type,
                token,
            },
        }]
    }

    /// Our direct socket for the pending init `token` is open.
    pub fn on_direct_connected(&mut self, token: u32, conn: ConnId) -> Vec<Action> {
        let Some(pending) = self.pending.remove(&token) else {
            debug!(token, %conn, "direct connection no longer needed");
            return vec![Action::Close(conn)];
        };

        let mut actions = vec![
            Action::Bind {
                conn,
                user: pending.user.clone(),
                conn_type: pending.conn_type,
            },
            Action::Write {
                conn,
                out: Outgoing::Init(PeerInit::PeerInit {
                    username: self.username.clone(),
                    conn_type: pending.conn_type,
                    token: 0,
                }),
            },
        ];
        self.establish(conn, pending, &mut actions);
        actions
    }

    pub fn on_direct_failed(&mut self, token: u32) -> Vec<Action> {
        let Some(pending) = self.pending.get_mut(&token) else {
            return Vec::new();
        };
        debug!(user = %pending.user, token, "direct connection failed");
        pending.direct = Attempt::Failed;
        if pending.is_exhausted() {
            self.fail(token, false).into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Our socket answering a relayed ConnectToPeer is open.
    pub fn on_pierce_connected(
        &mut self,
        conn: ConnId,
        user: &str,
        conn_type: ConnectionType,
        token: u32,
    ) -> Vec<Action> {
        self.register(conn, user, conn_type);
        vec![
            Action::Bind {
                conn,
                user: user.to_string(),
                conn_type,
            },
            Action::Write {
                conn,
                out: Outgoing::Init(PeerInit::PierceFirewall { token }),
            },
        ]
    }

    pub fn on_pierce_failed(&mut self, user: &str, token: u32) -> Vec<Action> {
        debug!(%user, token, "cannot answer indirect connection request");
        vec![Action::SendServer(ServerRequest::CantConnectToPeer {
            token,
            user: user.to_string(),
        })]
    }

    /// An incoming socket opened with PierceFirewall.
    pub fn on_incoming_pierce(&mut self, conn: ConnId, token: u32) -> Vec<Action> {
        let Some(pending) = self.pending.remove(&token) else {
            debug!(%conn, token, "pierce firewall for unknown or expired token");
            return vec![Action::Close(conn)];
        };
        info!(user = %pending.user, token, "indirect connection established");

        let mut actions = vec![Action::Bind {
            conn,
            user: pending.user.clone(),
            conn_type: pending.conn_type,
        }];
        self.establish(conn, pending, &mut actions);
        actions
    }

    /// An incoming socket opened with PeerInit.
    pub fn on_incoming_peer_init(
        &mut self,
        conn: ConnId,
        user: &str,
        conn_type: ConnectionType,
    ) -> Vec<Action> {
        self.register(conn, user, conn_type);
        let mut actions = vec![Action::Bind {
            conn,
            user: user.to_string(),
            conn_type,
        }];

        // Messages waiting for a P connection can use this one
        if conn_type == ConnectionType::Peer {
            let token = self
                .pending
                .iter()
                .find(|(_, p)| p.user == user && p.conn_type == ConnectionType::Peer)
                .map(|(token, _)| *token);
            if let Some(pending) = token.and_then(|t| self.pending.remove(&t)) {
                for (message, encoding) in pending.messages {
                    actions.push(Action::Write {
                        conn,
                        out: Outgoing::Peer(message, encoding),
                    });
                }
            }
        }
        actions
    }

    /// Server reports that the peer could not connect back to us.
    pub fn on_cant_connect(&mut self, token: u32) -> Vec<Action> {
        let Some(pending) = self.pending.get_mut(&token) else {
            return Vec::new();
        };
        debug!(user = %pending.user, token, "indirect connection failed");
        pending.indirect = Attempt::Failed;
        if pending.direct == Attempt::Running {
            return Vec::new();
        }
        self.fail(token, false).into_iter().collect()
    }

    /// Fails pending inits whose indirect request is older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Action> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.since) >= INDIRECT_REQUEST_TIMEOUT)
            .map(|(token, _)| *token)
            .collect();

        expired
            .into_iter()
            .filter_map(|token| {
                if let Some(p) = self.pending.get(&token) {
                    info!(
                        user = %p.user,
                        token,
                        conn_type = p.conn_type.as_str(),
                        "peer connection attempt expired"
                    );
                }
                self.fail(token, false)
            })
            .collect()
    }

    pub fn on_closed(&mut self, conn: ConnId) {
        if let Some(key) = self.bound.remove(&conn) {
            if self.live.get(&key) == Some(&conn) {
                self.live.remove(&key);
            }
        }
    }

    /// Forgets everything, e.g. after losing the server.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.awaiting_address.clear();
        self.addresses.clear();
        self.live.clear();
        self.bound.clear();
    }

    fn register(&mut self, conn: ConnId, user: &str, conn_type: ConnectionType) {
        if conn_type == ConnectionType::File {
            return;
        }
        let key = (user.to_string(), conn_type);
        if let Some(previous) = self.live.insert(key.clone(), conn) {
            if previous != conn {
                debug!(%user, %previous, %conn, "replacing peer connection");
            }
        }
        self.bound.insert(conn, key);
    }

    fn establish(&mut self, conn: ConnId, pending: PendingInit, actions: &mut Vec<Action>) {
        self.register(conn, &pending.user, pending.conn_type);

        if let Some(file_token) = pending.file_token {
            actions.push(Action::Write {
                conn,
                out: Outgoing::FileTransferInit(file_token),
            });
        }
        for (message, encoding) in pending.messages {
            actions.push(Action::Write {
                conn,
                out: Outgoing::Peer(message, encoding),
            });
        }
    }

    fn fail(&mut self, token: u32, offline: bool) -> Option<Action> {
        let pending = self.pending.remove(&token)?;
        if !offline {
            // Force a fresh lookup next time, the peer may have moved
            self.addresses.remove(&pending.user);
        }
        if let Some(tokens) = self.awaiting_address.get_mut(&pending.user) {
            tokens.retain(|t| *t != token);
        }
        Some(Action::Emit(NetEvent::PeerConnectionError {
            user: pending.user,
            conn_type: pending.conn_type,
            undelivered: pending.messages.into_iter().map(|(m, _)| m).collect(),
            file_token: pending.file_token,
            offline,
        }))
    }
}
