//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::time::Duration;
use streamnet_transport::{EndpointEvent, EndpointEventReceiver};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("streamnet_transport=debug")
        .try_init();
}

/// Next event matching `predicate`, skipping the others
pub async fn wait_for_event<F>(events: &mut EndpointEventReceiver, mut predicate: F) -> EndpointEvent
where
    F: FnMut(&EndpointEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("endpoint event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for endpoint event")
}

pub async fn wait_for_message(events: &mut EndpointEventReceiver) -> (String, String) {
    match wait_for_event(events, |e| matches!(e, EndpointEvent::MessageReceived { .. })).await {
        EndpointEvent::MessageReceived { peer_info, message } => (peer_info.peer_id, message),
        _ => unreachable!(),
    }
}

/// Poll `condition` until it holds
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition never held: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
