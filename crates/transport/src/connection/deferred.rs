//! One-shot bridge between `connect()` and the connection's outcome

use crate::error::ConnectionError;
use crate::peer_info::PeerId;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

/// Cloneable handle resolving to the connected peer id or the close reason
pub type ConnectionPromise = Shared<BoxFuture<'static, Result<PeerId, ConnectionError>>>;

/// Settles exactly once. Dropping it unsettled rejects waiters with `"closed"`.
///
/// Ownership can move to a replacement connection so the original caller's
/// promise still settles with the outcome of the new negotiation.
pub struct DeferredConnectionAttempt {
    sender: oneshot::Sender<Result<PeerId, ConnectionError>>,
    promise: ConnectionPromise,
}

impl DeferredConnectionAttempt {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let promise = async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(ConnectionError::closed()))
        }
        .boxed()
        .shared();

        Self { sender, promise }
    }

    pub fn promise(&self) -> ConnectionPromise {
        self.promise.clone()
    }

    pub fn resolve(self, peer_id: PeerId) {
        let _ = self.sender.send(Ok(peer_id));
    }

    pub fn reject(self, reason: ConnectionError) {
        let _ = self.sender.send(Err(reason));
    }
}

impl std::fmt::Debug for DeferredConnectionAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredConnectionAttempt")
            .field("settled", &self.sender.is_closed())
            .finish()
    }
}

impl Default for DeferredConnectionAttempt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_settles_all_clones() {
        let attempt = DeferredConnectionAttempt::new();
        let first = attempt.promise();
        let second = attempt.promise();
        attempt.resolve("peer2".to_string());

        assert_eq!(first.await, Ok("peer2".to_string()));
        assert_eq!(second.await, Ok("peer2".to_string()));
    }

    #[tokio::test]
    async fn test_reject() {
        let attempt = DeferredConnectionAttempt::new();
        let promise = attempt.promise();
        attempt.reject(ConnectionError::DeadConnection);
        assert_eq!(promise.await, Err(ConnectionError::DeadConnection));
    }

    #[tokio::test]
    async fn test_drop_rejects_with_closed() {
        let attempt = DeferredConnectionAttempt::new();
        let promise = attempt.promise();
        drop(attempt);
        assert_eq!(promise.await, Err(ConnectionError::closed()));
    }

    #[tokio::test]
    async fn test_promise_survives_transfer() {
        let attempt = DeferredConnectionAttempt::new();
        let promise = attempt.promise();

        let mut old_owner = Some(attempt);
        let new_owner = old_owner.take();
        assert!(old_owner.is_none());
        new_owner.unwrap().resolve("p".to_string());

        assert_eq!(promise.await, Ok("p".to_string()));
    }
}
