//! Video-management-system collaborator: clip retrieval by camera and
//! time window.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Vms: Send + Sync {
    /// Returns the URL of a clip covering `[from, to]` (unix seconds) for
    /// the given VMS camera identifier.
    async fn retrieve_clip(&self, vms_id: &str, from: i64, to: i64) -> Result<String>;
}

/// Dev VMS: fabricates a deterministic clip URL without talking to
/// anything.
pub struct FakeVms;

#[async_trait]
impl Vms for FakeVms {
    async fn retrieve_clip(&self, vms_id: &str, from: i64, to: i64) -> Result<String> {
        Ok(format!("vms://{vms_id}/clips?from={from}&to={to}"))
    }
}
