//! Presence, privileges and addresses of other users.
//!
//! The server reports user state in several messages (GetUserStatus,
//! WatchUser, PrivilegedUsers, GetPeerAddress, ...). [`UserDirectory`] folds
//! them into one view that the transfer queues consult.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

use crate::protocol::{ServerResponse, UserStatus};

/// What the server last told us about other users.
#[derive(Debug, Default)]
pub struct UserDirectory {
    logged_in: bool,
    statuses: HashMap<String, UserStatus>,
    privileged: HashSet<String>,
    addresses: HashMap<String, IpAddr>,
    watched: HashSet<String>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_logged_in(&mut self, logged_in: bool) {
        self.logged_in = logged_in;
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Records a status. Returns true if it differs from the previous one.
    pub fn set_status(&mut self, user: &str, status: UserStatus) -> bool {
        self.statuses.insert(user.to_string(), status) != Some(status)
    }

    pub fn status(&self, user: &str) -> Option<UserStatus> {
        self.statuses.get(user).copied()
    }

    /// A user is unreachable when we are logged out or the server reported
    /// them offline. Users we know nothing about are assumed reachable.
    pub fn is_offline(&self, user: &str) -> bool {
        !self.logged_in || self.status(user) == Some(UserStatus::Offline)
    }

    pub fn set_privileged_users<I>(&mut self, users: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.privileged = users.into_iter().collect();
    }

    pub fn set_privileged(&mut self, user: &str, privileged: bool) {
        if privileged {
            self.privileged.insert(user.to_string());
        } else {
            self.privileged.remove(user);
        }
    }

    pub fn is_privileged(&self, user: &str) -> bool {
        self.privileged.contains(user)
    }

    pub fn set_address(&mut self, user: &str, ip: IpAddr) {
        self.addresses.insert(user.to_string(), ip);
    }

    pub fn address(&self, user: &str) -> Option<IpAddr> {
        self.addresses.get(user).copied()
    }

    /// Marks `user` as watched. Returns true the first time, when a
    /// WatchUser request should be sent.
    pub fn watch(&mut self, user: &str) -> bool {
        self.watched.insert(user.to_string())
    }

    pub fn is_watched(&self, user: &str) -> bool {
        self.watched.contains(user)
    }

    /// Folds a server message into the directory. Returns the user and
    /// status when a presence change was reported.
    pub fn apply(&mut self, response: &ServerResponse) -> Option<(String, UserStatus)> {
        match response {
            ServerResponse::UserStatus {
                user,
                status,
                privileged,
            } => {
                if let Some(privileged) = privileged {
                    self.set_privileged(user, *privileged);
                }
                self.set_status(user, *status);
                Some((user.clone(), *status))
            }
            ServerResponse::WatchUser { user, details } => {
                // A user that does not exist is as unreachable as an offline one
                let status = details
                    .as_ref()
                    .map_or(UserStatus::Offline, |details| details.status);
                self.set_status(user, status);
                Some((user.clone(), status))
            }
            ServerResponse::PrivilegedUsers { users } => {
                debug!(count = users.len(), "privileged users");
                self.set_privileged_users(users.iter().cloned());
                None
            }
            ServerResponse::AddToPrivileged { user } => {
                self.set_privileged(user, true);
                None
            }
            ServerResponse::UserPrivileged { user, privileged } => {
                self.set_privileged(user, *privileged);
                None
            }
            ServerResponse::PeerAddress { user, ip, port } => {
                if *ip != Ipv4Addr::UNSPECIFIED && *port != 0 {
                    self.set_address(user, IpAddr::V4(*ip));
                }
                None
            }
            ServerResponse::ConnectToPeer { user, ip, privileged, .. } => {
                self.set_address(user, IpAddr::V4(*ip));
                if let Some(privileged) = privileged {
                    self.set_privileged(user, *privileged);
                }
                None
            }
            _ => None,
        }
    }

    /// Forgets session state after a server disconnect.
    pub fn clear(&mut self) {
        self.logged_in = false;
        self.statuses.clear();
        self.watched.clear();
        self.addresses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{UserStats, WatchedUser};

    #[test]
    fn test_offline_until_logged_in() {
        let mut users = UserDirectory::new();
        assert!(users.is_offline("alice"));
        users.set_logged_in(true);
        assert!(!users.is_offline("alice"));
        users.set_status("alice", UserStatus::Offline);
        assert!(users.is_offline("alice"));
    }

    #[test]
    fn test_apply_status_messages() {
        let mut users = UserDirectory::new();
        users.set_logged_in(true);

        let change = users.apply(&ServerResponse::UserStatus {
            user: "bob".into(),
            status: UserStatus::Away,
            privileged: Some(true),
        });
        assert_eq!(change, Some(("bob".to_string(), UserStatus::Away)));
        assert!(users.is_privileged("bob"));

        let change = users.apply(&ServerResponse::WatchUser {
            user: "ghost".into(),
            details: None,
        });
        assert_eq!(change, Some(("ghost".to_string(), UserStatus::Offline)));
        assert!(users.is_offline("ghost"));

        users.apply(&ServerResponse::WatchUser {
            user: "carol".into(),
            details: Some(WatchedUser {
                status: UserStatus::Online,
                stats: UserStats::default(),
                country: Some("NL".into()),
            }),
        });
        assert_eq!(users.status("carol"), Some(UserStatus::Online));
    }

    #[test]
    fn test_watch_once() {
        let mut users = UserDirectory::new();
        assert!(users.watch("alice"));
        assert!(!users.watch("alice"));
        users.clear();
        assert!(users.watch("alice"));
    }
}
