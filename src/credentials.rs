//! Password broker between the connection layer and whoever can ask the user.
//!
//! Requests for the same endpoint coalesce: one prompt goes out, every caller
//! waiting on that endpoint gets the answer.

use crate::client::ConnectionId;
use crate::error::CredentialError;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Reply = Result<SecretString, CredentialError>;

/// Sent once per endpoint when a password is needed and none is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub id: ConnectionId,
}

#[derive(Default)]
struct State {
    remembered: HashMap<ConnectionId, SecretString>,
    pending: HashMap<ConnectionId, Vec<oneshot::Sender<Reply>>>,
}

#[derive(Clone)]
pub struct CredentialBroker {
    state: Arc<Mutex<State>>,
    prompts: mpsc::UnboundedSender<PromptRequest>,
}

impl CredentialBroker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PromptRequest>) {
        let (prompts, rx) = mpsc::unbounded_channel();
        let broker = Self {
            state: Arc::new(Mutex::new(State::default())),
            prompts,
        };
        (broker, rx)
    }

    /// The remembered password for `id`, or waits for `set_password`.
    pub async fn password(&self, id: &ConnectionId) -> Reply {
        let rx = {
            let mut state = self.state.lock();
            if let Some(secret) = state.remembered.get(id) {
                return Ok(secret.clone());
            }
            let (tx, rx) = oneshot::channel();
            let waiters = state.pending.entry(id.clone()).or_default();
            waiters.push(tx);
            if waiters.len() == 1 {
                debug!(id = %id, "requesting password");
                let _ = self.prompts.send(PromptRequest { id: id.clone() });
            }
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(CredentialError::Cancelled(id.clone())))
    }

    /// Answers every pending request for `id`.
    pub fn set_password(&self, id: &ConnectionId, secret: SecretString, remember: bool) {
        let waiters = {
            let mut state = self.state.lock();
            if remember {
                state.remembered.insert(id.clone(), secret.clone());
            }
            state.pending.remove(id).unwrap_or_default()
        };
        for tx in waiters {
            let _ = tx.send(Ok(secret.clone()));
        }
    }

    /// Rejects every pending request for `id`.
    pub fn cancel(&self, id: &ConnectionId) {
        let waiters = self.state.lock().pending.remove(id).unwrap_or_default();
        debug!(id = %id, waiters = waiters.len(), "password request cancelled");
        for tx in waiters {
            let _ = tx.send(Err(CredentialError::Cancelled(id.clone())));
        }
    }

    pub fn forget(&self, id: &ConnectionId) {
        self.state.lock().remembered.remove(id);
    }

    pub fn is_pending(&self, id: &ConnectionId) -> bool {
        self.state.lock().pending.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use secrecy::ExposeSecret;
    use std::time::Duration;

    fn id() -> ConnectionId {
        ConnectionId::remote(Protocol::Sftp, "alice", "nas", 22)
    }

    async fn until_pending(broker: &CredentialBroker, waiters: usize) {
        for _ in 0..100 {
            if broker.state.lock().pending.get(&id()).map_or(0, Vec::len) == waiters {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("requests never queued");
    }

    #[tokio::test]
    async fn test_requests_coalesce_into_one_prompt() {
        let (broker, mut prompts) = CredentialBroker::new();
        let first = tokio::spawn({
            let broker = broker.clone();
            async move { broker.password(&id()).await }
        });
        let second = tokio::spawn({
            let broker = broker.clone();
            async move { broker.password(&id()).await }
        });
        until_pending(&broker, 2).await;

        assert_eq!(prompts.recv().await, Some(PromptRequest { id: id() }));
        assert!(prompts.try_recv().is_err());

        broker.set_password(&id(), SecretString::from("hunter2"), false);
        assert_eq!(first.await.unwrap().unwrap().expose_secret(), "hunter2");
        assert_eq!(second.await.unwrap().unwrap().expose_secret(), "hunter2");
        assert!(!broker.is_pending(&id()));
    }

    #[tokio::test]
    async fn test_cancel_rejects_all_waiters() {
        let (broker, _prompts) = CredentialBroker::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.password(&id()).await })
            })
            .collect();
        until_pending(&broker, 3).await;

        broker.cancel(&id());
        for waiter in waiters {
            assert_eq!(
                waiter.await.unwrap().unwrap_err(),
                CredentialError::Cancelled(id())
            );
        }
    }

    #[tokio::test]
    async fn test_remembered_password_skips_prompt() {
        let (broker, mut prompts) = CredentialBroker::new();
        broker.set_password(&id(), SecretString::from("pw"), true);

        let secret = broker.password(&id()).await.unwrap();
        assert_eq!(secret.expose_secret(), "pw");
        assert!(prompts.try_recv().is_err());

        broker.forget(&id());
        let pending = tokio::spawn({
            let broker = broker.clone();
            async move { broker.password(&id()).await }
        });
        assert_eq!(prompts.recv().await, Some(PromptRequest { id: id() }));
        broker.cancel(&id());
        assert!(pending.await.unwrap().is_err());
    }
}
