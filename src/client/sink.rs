use std::path::PathBuf;

use anyhow::Context as _;
use image::RgbImage;

use crate::{
    foundation::{
        core::Resolution,
        error::{FramecastError, FramecastResult},
    },
    protocol::StreamInfo,
};

/// Consumer of decoded frames.
///
/// `begin` is called after every accepted `INFO` reply, so a resumed stream announces itself
/// again. Within one asset `push_frame` indices strictly increase and never repeat.
pub trait FrameSink: Send {
    fn begin(&mut self, info: &StreamInfo) -> FramecastResult<()>;
    /// Push one frame as tightly packed RGB8.
    fn push_frame(&mut self, index: u32, rgb: &[u8]) -> FramecastResult<()>;
    /// Called once after the last frame of a completed stream.
    fn end(&mut self) -> FramecastResult<()>;
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn begin(&mut self, info: &StreamInfo) -> FramecastResult<()> {
        (**self).begin(info)
    }

    fn push_frame(&mut self, index: u32, rgb: &[u8]) -> FramecastResult<()> {
        (**self).push_frame(index, rgb)
    }

    fn end(&mut self) -> FramecastResult<()> {
        (**self).end()
    }
}

/// In-memory sink for tests and debugging.
#[derive(Debug, Default)]
pub struct InMemorySink {
    infos: Vec<StreamInfo>,
    frames: Vec<(u32, Vec<u8>)>,
    ended: bool,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `INFO` seen, one per successful (re)connect.
    pub fn infos(&self) -> &[StreamInfo] {
        &self.infos
    }

    pub fn frames(&self) -> &[(u32, Vec<u8>)] {
        &self.frames
    }

    pub fn ended(&self) -> bool {
        self.ended
    }
}

impl FrameSink for InMemorySink {
    fn begin(&mut self, info: &StreamInfo) -> FramecastResult<()> {
        self.infos.push(info.clone());
        Ok(())
    }

    fn push_frame(&mut self, index: u32, rgb: &[u8]) -> FramecastResult<()> {
        self.frames.push((index, rgb.to_vec()));
        Ok(())
    }

    fn end(&mut self) -> FramecastResult<()> {
        self.ended = true;
        Ok(())
    }
}

/// Writes each frame as `<dir>/<asset>_<NNNN>.png`.
#[derive(Debug)]
pub struct PngSink {
    dir: PathBuf,
    current: Option<(Resolution, String)>,
    written: u32,
}

impl PngSink {
    pub fn new(dir: impl Into<PathBuf>) -> FramecastResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create output dir '{}'", dir.display()))?;
        Ok(Self {
            dir,
            current: None,
            written: 0,
        })
    }

    pub fn written(&self) -> u32 {
        self.written
    }
}

impl FrameSink for PngSink {
    fn begin(&mut self, info: &StreamInfo) -> FramecastResult<()> {
        self.current = Some((info.resolution, info.name.clone()));
        Ok(())
    }

    fn push_frame(&mut self, index: u32, rgb: &[u8]) -> FramecastResult<()> {
        let Some((res, name)) = &self.current else {
            return Err(FramecastError::client("frame pushed before begin"));
        };
        let img = RgbImage::from_raw(res.width, res.height, rgb.to_vec())
            .ok_or_else(|| FramecastError::client(format!("frame {index} has the wrong size")))?;
        let path = self.dir.join(format!("{name}_{index:04}.png"));
        img.save(&path)
            .map_err(|err| FramecastError::client(format!("write '{}': {err}", path.display())))?;
        self.written += 1;
        Ok(())
    }

    fn end(&mut self) -> FramecastResult<()> {
        tracing::info!(dir = %self.dir.display(), frames = self.written, "frames written");
        Ok(())
    }
}

/// Counts frames and drops them.
#[derive(Debug, Default)]
pub struct CountingSink {
    pub frames: u32,
}

impl FrameSink for CountingSink {
    fn begin(&mut self, _info: &StreamInfo) -> FramecastResult<()> {
        Ok(())
    }

    fn push_frame(&mut self, _index: u32, _rgb: &[u8]) -> FramecastResult<()> {
        self.frames += 1;
        Ok(())
    }

    fn end(&mut self) -> FramecastResult<()> {
        Ok(())
    }
}
