//! Backend that performs no I/O: publishes succeed at once, nothing is ever delivered.
//!
//! There is no connection, so no [`ConnectionEvent`](super::ConnectionEvent) is ever published.

use async_trait::async_trait;

use super::{Payload, Publisher, Signals, Subscription};
use crate::error::BusError;

#[derive(Debug, Default)]
pub struct NullPublisher {
    signals: Signals,
}

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _topic: &str, _payload: &Payload) -> Result<(), BusError> {
        Ok(())
    }

    fn signals(&self) -> &Signals {
        &self.signals
    }
}

pub fn subscribe() -> Subscription {
    Subscription::idle(Signals::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test]
    async fn test_subscription_is_silent_until_closed() {
        let mut sub = subscribe();
        let mut events = sub.events();

        let waited = tokio::time::timeout(Duration::from_millis(20), sub.next()).await;
        assert!(waited.is_err());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        sub.close().await;
        assert!(sub.next().await.is_none());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_publish_always_succeeds() {
        let publisher = NullPublisher::default();
        let mut events = publisher.signals().subscribe();
        publisher
            .publish("bench", &Payload::build(8, 3))
            .await
            .unwrap();
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }
}
