//! In-process pub/sub of orphaned-camera batches.
//!
//! Managers subscribe to receive batches and unsubscribe under capacity
//! pressure; in monitor mode the monitor loop publishes what its registry
//! scan found. Batches arrive in publish order with no duplicate
//! suppression.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use common::model::Camera;

pub mod channel;
pub mod timed;

pub use channel::ChannelOrphanSource;
pub use timed::TimedOrphanSource;

/// Buffered depth for orphan batch delivery.
pub const ORPHAN_BATCH_CAPACITY: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrphanError {
    #[error("already subscribed to orphaned cameras, unsubscribe first")]
    AlreadySubscribed,
    #[error("not subscribed to orphaned cameras")]
    NotSubscribed,
}

#[async_trait]
pub trait OrphanSource: Send + Sync {
    /// Starts delivery and returns a fresh batch stream. Fails with
    /// `AlreadySubscribed` while a previous subscription is live.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<Camera>>, OrphanError>;

    /// Stops delivery. Calling while not subscribed is an error
    /// (`NotSubscribed`), never a silent no-op.
    async fn unsubscribe(&self) -> Result<(), OrphanError>;

    /// Hands a batch to the current subscriber, if any. Only meaningful
    /// for monitor-driven sources; with no subscriber the batch is
    /// dropped.
    async fn publish(&self, batch: Vec<Camera>) -> Result<(), OrphanError>;
}
