//! Monitor-driven orphan source: the monitor loop pushes batches, the
//! manager pops them.

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use common::model::Camera;

use super::{OrphanError, OrphanSource, ORPHAN_BATCH_CAPACITY};

pub struct ChannelOrphanSource {
    cancel: CancellationToken,
    delivery: Mutex<Option<mpsc::Sender<Vec<Camera>>>>,
}

impl ChannelOrphanSource {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            delivery: Mutex::new(None),
        }
    }
}

#[async_trait]
impl OrphanSource for ChannelOrphanSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<Camera>>, OrphanError> {
        let mut delivery = self.delivery.lock().await;
        if let Some(tx) = delivery.as_ref() {
            // A dropped receiver without an unsubscribe counts as gone.
            if !tx.is_closed() {
                return Err(OrphanError::AlreadySubscribed);
            }
        }
        let (tx, rx) = mpsc::channel(ORPHAN_BATCH_CAPACITY);
        *delivery = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), OrphanError> {
        let mut delivery = self.delivery.lock().await;
        match delivery.take() {
            Some(_) => Ok(()),
            None => Err(OrphanError::NotSubscribed),
        }
    }

    async fn publish(&self, batch: Vec<Camera>) -> Result<(), OrphanError> {
        let delivery = self.delivery.lock().await;
        let Some(tx) = delivery.as_ref() else {
            // Nobody listening; the next monitor scan will re-surface
            // still-orphaned cameras.
            return Ok(());
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            res = tx.send(batch) => {
                // A closed receiver is equivalent to no subscriber.
                let _ = res;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(id: &str) -> Camera {
        Camera {
            id: id.to_string(),
            ..Camera::default()
        }
    }

    #[tokio::test]
    async fn second_subscribe_fails_until_unsubscribed() {
        let source = ChannelOrphanSource::new(CancellationToken::new());

        let _rx = source.subscribe().await.unwrap();
        assert_eq!(source.subscribe().await.err(), Some(OrphanError::AlreadySubscribed));

        source.unsubscribe().await.unwrap();
        assert!(source.subscribe().await.is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_is_an_error() {
        let source = ChannelOrphanSource::new(CancellationToken::new());
        assert_eq!(source.unsubscribe().await.err(), Some(OrphanError::NotSubscribed));
    }

    #[tokio::test]
    async fn batches_arrive_in_publish_order() {
        let source = ChannelOrphanSource::new(CancellationToken::new());
        let mut rx = source.subscribe().await.unwrap();

        source.publish(vec![camera("a")]).await.unwrap();
        source.publish(vec![camera("b"), camera("c")]).await.unwrap();

        assert_eq!(rx.recv().await.unwrap()[0].id, "a");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].id, "b");
    }

    #[tokio::test]
    async fn publish_without_subscriber_drops_the_batch() {
        let source = ChannelOrphanSource::new(CancellationToken::new());
        assert!(source.publish(vec![camera("a")]).await.is_ok());
    }

    #[tokio::test]
    async fn resubscribe_yields_a_fresh_stream() {
        let source = ChannelOrphanSource::new(CancellationToken::new());

        let mut first = source.subscribe().await.unwrap();
        source.publish(vec![camera("a")]).await.unwrap();
        source.unsubscribe().await.unwrap();
        // The old stream ends once its buffered batches are consumed.
        assert!(first.recv().await.is_some());
        assert!(first.recv().await.is_none());

        let mut second = source.subscribe().await.unwrap();
        source.publish(vec![camera("b")]).await.unwrap();
        assert_eq!(second.recv().await.unwrap()[0].id, "b");
    }
}
