//! Video decode collaborator.
//!
//! The framer only sees these two traits; the shipped implementation
//! shells out to ffmpeg/ffprobe, decoding the source into raw RGB frames
//! over a pipe.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::RgbImage;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

use crate::frame::Frame;

#[async_trait]
pub trait VideoSource: Send {
    /// Next decoded frame; `Ok(None)` when the stream ends.
    async fn read_frame(&mut self) -> Result<Option<Frame>>;
}

#[async_trait]
pub trait VideoSourceOpener: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Box<dyn VideoSource>>;
}

pub struct FfmpegOpener;

#[async_trait]
impl VideoSourceOpener for FfmpegOpener {
    async fn open(&self, uri: &str) -> Result<Box<dyn VideoSource>> {
        let (width, height) = probe_dimensions(uri).await?;
        debug!(uri = %uri, width, height, "opening video source");

        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-rtsp_transport",
                "tcp",
                "-i",
                uri,
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn ffmpeg")?;
        let stdout = child.stdout.take().context("ffmpeg stdout unavailable")?;

        Ok(Box::new(FfmpegVideoSource {
            _child: child,
            stdout,
            width,
            height,
            seq: 0,
        }))
    }
}

struct FfmpegVideoSource {
    _child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    seq: u64,
}

#[async_trait]
impl VideoSource for FfmpegVideoSource {
    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut raw = vec![0u8; (self.width * self.height * 3) as usize];
        match self.stdout.read_exact(&mut raw).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err).context("error reading decoded frame"),
        }
        let image = RgbImage::from_raw(self.width, self.height, raw)
            .context("decoded frame has unexpected length")?;
        self.seq += 1;
        Ok(Some(Frame::new(self.seq, image)))
    }
}

async fn probe_dimensions(uri: &str) -> Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0",
            uri,
        ])
        .output()
        .await
        .context("failed to execute ffprobe")?;

    if !output.status.success() {
        anyhow::bail!("ffprobe failed: {:?}", output.status);
    }

    let text = String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;
    let fields: Vec<&str> = text.trim().split(',').collect();
    if fields.len() != 2 {
        anyhow::bail!("unexpected ffprobe output: {text}");
    }
    let width: u32 = fields[0].parse().context("failed to parse width")?;
    let height: u32 = fields[1].parse().context("failed to parse height")?;
    Ok((width, height))
}
