//! Outbound message queue with bounded retries

use crate::error::ConnectionError;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::warn;

/// Failed delivery attempts after which a message is dropped
pub const MAX_TRIES: u32 = 10;

/// Outcome reported to the caller of `send()` for one message
pub type SendOutcome = Result<(), ConnectionError>;

/// A queued outbound message and its delivery bookkeeping
#[derive(Debug)]
pub struct QueueItem {
    seq: u64,
    message: String,
    tries: u32,
    infos: Vec<String>,
    failed: bool,
    responder: Option<oneshot::Sender<SendOutcome>>,
}

impl QueueItem {
    fn new(seq: u64, message: String, responder: oneshot::Sender<SendOutcome>) -> Self {
        Self {
            seq,
            message,
            tries: 0,
            infos: Vec::new(),
            failed: false,
            responder: Some(responder),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Record a failed attempt. Marks the item failed once `MAX_TRIES` is reached.
    pub fn increment_tries(&mut self, info: String) {
        self.tries += 1;
        self.infos.push(info);
        if self.tries >= MAX_TRIES {
            self.failed = true;
        }
    }

    /// Error describing every failed attempt so far
    pub fn failure(&self) -> ConnectionError {
        ConnectionError::SendFailed {
            tries: self.tries,
            infos: self.infos.clone(),
        }
    }

    pub fn delivered(mut self) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(Ok(()));
        }
    }

    pub fn reject(mut self, err: ConnectionError) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(Err(err));
        }
    }
}

/// FIFO of [`QueueItem`]s for one connection
#[derive(Debug)]
pub struct MessageQueue {
    items: VecDeque<QueueItem>,
    max_size: usize,
    next_seq: u64,
}

impl MessageQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size: max_size.max(1),
            next_seq: 0,
        }
    }

    /// Append a message, evicting the oldest one when full.
    ///
    /// The returned receiver settles when the message is delivered or dropped.
    pub fn add(&mut self, message: String) -> oneshot::Receiver<SendOutcome> {
        if self.items.len() >= self.max_size {
            if let Some(evicted) = self.items.pop_front() {
                warn!(
                    "Message queue full ({} items), dropping oldest message",
                    self.max_size
                );
                evicted.reject(ConnectionError::QueueOverflow);
            }
        }

        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push_back(QueueItem::new(seq, message, tx));
        rx
    }

    pub fn peek(&self) -> Option<&QueueItem> {
        self.items.front()
    }

    pub fn peek_mut(&mut self) -> Option<&mut QueueItem> {
        self.items.front_mut()
    }

    pub fn pop(&mut self) -> Option<QueueItem> {
        self.items.pop_front()
    }

    /// Pop the head only if it is still the item identified by `seq`.
    ///
    /// The head can be evicted by `add()` while a send is in flight.
    pub fn pop_if(&mut self, seq: u64) -> Option<QueueItem> {
        match self.items.front() {
            Some(item) if item.seq == seq => self.items.pop_front(),
            _ => None,
        }
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every pending message, rejecting each with `reason`
    pub fn clear(&mut self, reason: ConnectionError) {
        for item in self.items.drain(..) {
            item.reject(reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = MessageQueue::new(10);
        let _a = queue.add("a".to_string());
        let _b = queue.add("b".to_string());

        assert_eq!(queue.size(), 2);
        assert_eq!(queue.peek().unwrap().message(), "a");
        assert_eq!(queue.pop().unwrap().message(), "a");
        assert_eq!(queue.pop().unwrap().message(), "b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_delivered_resolves_sender() {
        let mut queue = MessageQueue::new(10);
        let rx = queue.add("a".to_string());
        queue.pop().unwrap().delivered();
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let mut queue = MessageQueue::new(2);
        let first = queue.add("a".to_string());
        let _second = queue.add("b".to_string());
        let _third = queue.add("c".to_string());

        assert_eq!(queue.size(), 2);
        assert_eq!(queue.peek().unwrap().message(), "b");
        assert_eq!(first.await.unwrap(), Err(ConnectionError::QueueOverflow));
    }

    #[test]
    fn test_fails_after_max_tries() {
        let mut queue = MessageQueue::new(10);
        let _rx = queue.add("a".to_string());
        let item = queue.peek_mut().unwrap();

        for i in 0..MAX_TRIES - 1 {
            item.increment_tries(format!("attempt {}", i));
            assert!(!item.is_failed());
        }
        item.increment_tries("last".to_string());
        assert!(item.is_failed());
        assert!(matches!(
            item.failure(),
            ConnectionError::SendFailed { tries: MAX_TRIES, .. }
        ));
    }

    #[test]
    fn test_pop_if_skips_evicted_head() {
        let mut queue = MessageQueue::new(1);
        let _a = queue.add("a".to_string());
        let seq = queue.peek().unwrap().seq();
        let _b = queue.add("b".to_string());

        assert!(queue.pop_if(seq).is_none());
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_clear_rejects_all() {
        let mut queue = MessageQueue::new(10);
        let a = queue.add("a".to_string());
        let b = queue.add("b".to_string());
        queue.clear(ConnectionError::closed());

        assert!(queue.is_empty());
        assert_eq!(a.await.unwrap(), Err(ConnectionError::closed()));
        assert_eq!(b.await.unwrap(), Err(ConnectionError::closed()));
    }
}
