//! Authenticated identity as seen by the sync core.
//!
//! The sign-in flow lives outside this crate. The core only needs to ask
//! "who is signed in right now" and to hear about changes, so that a flush
//! can run as soon as somebody signs in.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Identity of an authenticated principal (the remote store's user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Source of the current identity.
///
/// Absence of an identity means "cannot flush", never an error.
pub trait IdentityProvider: Send + Sync {
    /// The identity signed in right now, if any.
    fn current_identity(&self) -> Option<Identity>;

    /// Receiver notified on every sign-in / sign-out.
    fn watch(&self) -> watch::Receiver<Option<Identity>>;
}

/// In-process identity holder driven by the embedding auth layer.
pub struct SessionIdentity {
    tx: watch::Sender<Option<Identity>>,
}

impl SessionIdentity {
    /// Start signed out.
    pub fn signed_out() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Start signed in as `identity`.
    pub fn signed_in(identity: impl Into<Identity>) -> Self {
        let (tx, _) = watch::channel(Some(identity.into()));
        Self { tx }
    }

    pub fn sign_in(&self, identity: impl Into<Identity>) {
        let identity = identity.into();
        log::info!("Identity signed in: {identity}");
        self.tx.send_replace(Some(identity));
    }

    pub fn sign_out(&self) {
        log::info!("Identity signed out");
        self.tx.send_replace(None);
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_identity(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_sign_in_out() {
        let session = SessionIdentity::signed_out();
        assert_eq!(session.current_identity(), None);

        session.sign_in("u1");
        assert_eq!(session.current_identity(), Some(Identity::new("u1")));

        session.sign_out();
        assert_eq!(session.current_identity(), None);
    }

    #[tokio::test]
    async fn test_watch_sees_changes() {
        let session = SessionIdentity::signed_out();
        let mut rx = session.watch();

        session.sign_in("u2");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(Identity::as_str), Some("u2"));
    }

    #[test]
    fn test_identity_serde_transparent() {
        let json = serde_json::to_string(&Identity::new("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }
}
