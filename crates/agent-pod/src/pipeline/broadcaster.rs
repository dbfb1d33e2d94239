//! Live-broadcast streamer. Processing is a stub; the stage exists to
//! exercise fan-out, stats and lifecycle plumbing for a future WebRTC
//! sink.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use common::config::BROADCASTER_STREAMER;
use common::frame::Frame;

use super::streamer::{
    spawn_worker_pool, FrameWorker, Streamer, StreamerContext, WorkerFactory,
};

#[derive(Default)]
pub struct BroadcasterStreamer;

impl Streamer for BroadcasterStreamer {
    fn name(&self) -> &'static str {
        BROADCASTER_STREAMER
    }

    fn spawn(&self, ctx: StreamerContext) -> mpsc::Sender<Frame> {
        spawn_worker_pool(BROADCASTER_STREAMER, &ctx, Arc::new(BroadcasterFactory))
    }
}

struct BroadcasterFactory;

impl WorkerFactory for BroadcasterFactory {
    fn make(&self, _worker: usize) -> Box<dyn FrameWorker> {
        Box::new(BroadcasterWorker)
    }
}

struct BroadcasterWorker;

#[async_trait]
impl FrameWorker for BroadcasterWorker {
    async fn process(&mut self, frame: Frame) -> anyhow::Result<()> {
        // Dropping the frame is the whole job for now.
        drop(frame);
        Ok(())
    }
}
