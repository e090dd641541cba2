//! Connection admission and per-command access control.
//!
//! Authentication happens in two layers: when a remote finishes its
//! transport handshake the admission dialog consults the application's allow
//! callback and stamps the resulting identity on the connection, and every
//! received command is then checked against its category's access policy.

use std::fmt;
use std::net::IpAddr;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::keys::PubKey;

/// Authentication levels for command categories and connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthLevel {
    /// No authentication; any admitted connection may invoke the command.
    #[default]
    None,
    /// Requires a logged-in or otherwise recognised peer.
    Basic,
    /// Requires an administrative peer; protects shutdown-class commands.
    Admin,
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthLevel::None => "none",
            AuthLevel::Basic => "basic",
            AuthLevel::Admin => "admin",
        })
    }
}

/// Access policy for a command category.
#[derive(Debug, Clone, Copy, Default)]
pub struct Access {
    /// Minimum auth level required of the calling peer.
    pub auth: AuthLevel,
    /// Only peers recognised as service nodes may call these commands.
    pub remote_sn: bool,
    /// The local instance must itself be a service node.
    pub local_sn: bool,
}

impl Access {
    /// Policy requiring only the given auth level.
    pub fn level(auth: AuthLevel) -> Self {
        Self {
            auth,
            ..Self::default()
        }
    }
}

/// Grant returned by the allow callback for an admitted connection.
#[derive(Debug, Clone, Copy)]
pub struct Allow {
    /// Initial auth level of the connection.
    pub auth: AuthLevel,
    /// Whether the remote is a recognised service node.
    pub remote_sn: bool,
}

/// Callback deciding whether an incoming connection is admitted.
///
/// Returning `None` refuses the connection.
pub type AllowFn = dyn Fn(IpAddr, &PubKey) -> Option<Allow> + Send + Sync;

/// Callback resolving a peer pubkey to a connect address (`host:port`).
pub type LookupFn = dyn Fn(&PubKey) -> Option<String> + Send + Sync;

/// One admission request from a handshaking connection.
///
/// The handshake task blocks on `reply` until the proxy has consulted the
/// allow callback.
pub(crate) struct AuthRequest {
    pub ip: IpAddr,
    pub pubkey: PubKey,
    pub reply: oneshot::Sender<Option<Allow>>,
}

/// Runs the admission dialog on behalf of the proxy.
pub(crate) struct Authenticator {
    allow: std::sync::Arc<AllowFn>,
    denied: u64,
}

impl Authenticator {
    pub fn new(allow: std::sync::Arc<AllowFn>) -> Self {
        Self { allow, denied: 0 }
    }

    /// Decide one admission request and answer the handshake task.
    pub fn handle(&mut self, req: AuthRequest) {
        let decision = (self.allow)(req.ip, &req.pubkey);
        match &decision {
            Some(allow) => {
                debug!(
                    "allowing incoming connection from {} ({}, auth {}, sn {})",
                    req.ip, req.pubkey, allow.auth, allow.remote_sn
                );
            }
            None => {
                self.denied += 1;
                warn!(
                    "denying incoming connection from {} ({})",
                    req.ip, req.pubkey
                );
            }
        }
        // The handshake task may have timed out already; nothing to do then.
        let _ = req.reply.send(decision);
    }

    /// Number of connections refused so far.
    pub fn denied(&self) -> u64 {
        self.denied
    }
}

/// Check a peer's credentials against a category's access policy.
pub(crate) fn access_granted(
    access: &Access,
    peer_auth: AuthLevel,
    peer_sn: bool,
    local_sn: bool,
) -> bool {
    peer_auth >= access.auth && (!access.remote_sn || peer_sn) && (!access.local_sn || local_sn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_level_ordering() {
        assert!(AuthLevel::None < AuthLevel::Basic);
        assert!(AuthLevel::Basic < AuthLevel::Admin);
    }

    #[test]
    fn test_access_minimum_level() {
        let access = Access::level(AuthLevel::Admin);
        assert!(!access_granted(&access, AuthLevel::None, false, false));
        assert!(!access_granted(&access, AuthLevel::Basic, false, false));
        assert!(access_granted(&access, AuthLevel::Admin, false, false));
    }

    #[test]
    fn test_access_sn_requirements() {
        let remote = Access {
            remote_sn: true,
            ..Access::default()
        };
        assert!(!access_granted(&remote, AuthLevel::Admin, false, false));
        assert!(access_granted(&remote, AuthLevel::None, true, false));

        let local = Access {
            local_sn: true,
            ..Access::default()
        };
        assert!(!access_granted(&local, AuthLevel::Admin, true, false));
        assert!(access_granted(&local, AuthLevel::None, false, true));
    }
}
