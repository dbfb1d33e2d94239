//! The decoded-frame type and its allocation ledger.
//!
//! Frame ownership is the release discipline: constructing or cloning a
//! frame counts an allocation, dropping it counts the release. Fan-out
//! clones are independent allocations with their own release. The
//! process-wide ledger lets shutdown tests assert that every allocation
//! was released exactly once.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};

static ALLOCATED: AtomicU64 = AtomicU64::new(0);
static RELEASED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(seq: u64, image: RgbImage) -> Self {
        ALLOCATED.fetch_add(1, Ordering::Relaxed);
        Self {
            seq,
            captured_at: Utc::now(),
            image,
        }
    }

    /// Solid-color synthetic frame for the dev framer and tests.
    pub fn synthetic(seq: u64, width: u32, height: u32) -> Self {
        let shade = (seq % 256) as u8;
        Self::new(seq, RgbImage::from_pixel(width, height, Rgb([shade, shade, shade])))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        ALLOCATED.fetch_add(1, Ordering::Relaxed);
        Self {
            seq: self.seq,
            captured_at: self.captured_at,
            image: self.image.clone(),
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        RELEASED.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub allocated: u64,
    pub released: u64,
}

impl LedgerSnapshot {
    /// Frames currently alive.
    pub fn outstanding(&self) -> u64 {
        self.allocated - self.released
    }
}

pub fn ledger() -> LedgerSnapshot {
    // Released is read first so a concurrent allocation can never make
    // outstanding underflow.
    let released = RELEASED.load(Ordering::Acquire);
    let allocated = ALLOCATED.load(Ordering::Acquire);
    LedgerSnapshot {
        allocated,
        released,
    }
}
