use std::{fs::File, io::BufReader, path::Path};

use anyhow::Context as _;
use image::{AnimationDecoder as _, ImageDecoder as _, RgbaImage, codecs::gif::GifDecoder};
use rayon::prelude::*;

use crate::{
    codec::rgb565,
    foundation::{
        core::Resolution,
        error::{FramecastError, FramecastResult},
    },
};

/// What cataloging needs to know about a source file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub n_frames: u32,
}

/// Decodes GIF sources and packs frames as big-endian RGB565.
///
/// Decoding is deterministic: the same file at the same resolution always yields the same bytes,
/// whether the frames end up in the disk cache or go straight to a socket.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    filter: image::imageops::FilterType,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            filter: image::imageops::FilterType::CatmullRom,
        }
    }

    /// Read dimensions and frame count without resizing anything.
    pub fn probe(&self, path: &Path) -> FramecastResult<SourceInfo> {
        let decoder = open_gif(path)?;
        let (width, height) = decoder.dimensions();
        let mut n_frames = 0u32;
        for frame in decoder.into_frames() {
            frame.with_context(|| format!("decode frame {n_frames} of '{}'", path.display()))?;
            n_frames += 1;
        }
        if n_frames == 0 {
            return Err(FramecastError::codec(format!(
                "'{}' contains no frames",
                path.display()
            )));
        }
        Ok(SourceInfo {
            width,
            height,
            n_frames,
        })
    }

    /// Decode every frame of `path`, resize to `res`, and pack each as RGB565.
    ///
    /// Every returned buffer is exactly `res.frame_len()` bytes.
    #[tracing::instrument(skip_all, fields(path = %path.display(), res = %res))]
    pub fn decode_packed(&self, path: &Path, res: Resolution) -> FramecastResult<Vec<Vec<u8>>> {
        let frames = decode_rgba_frames(path)?;
        frames
            .par_iter()
            .map(|frame| self.pack_frame(frame, res))
            .collect()
    }

    /// Resize one composited RGBA frame and pack it. Alpha is discarded.
    pub fn pack_frame(&self, frame: &RgbaImage, res: Resolution) -> FramecastResult<Vec<u8>> {
        let rgb = image::DynamicImage::ImageRgba8(frame.clone()).into_rgb8();
        let resized = if rgb.dimensions() == (res.width, res.height) {
            rgb
        } else {
            image::imageops::resize(&rgb, res.width, res.height, self.filter)
        };
        let packed = rgb565::pack_rgb8(resized.as_raw())?;
        debug_assert_eq!(packed.len(), res.frame_len());
        Ok(packed)
    }
}

fn open_gif(path: &Path) -> FramecastResult<GifDecoder<BufReader<File>>> {
    let f = File::open(path).with_context(|| format!("open source '{}'", path.display()))?;
    let decoder = GifDecoder::new(BufReader::new(f))
        .with_context(|| format!("read gif header of '{}'", path.display()))?;
    Ok(decoder)
}

fn decode_rgba_frames(path: &Path) -> FramecastResult<Vec<RgbaImage>> {
    let frames = open_gif(path)?
        .into_frames()
        .collect_frames()
        .with_context(|| format!("decode frames of '{}'", path.display()))?;
    if frames.is_empty() {
        return Err(FramecastError::codec(format!(
            "'{}' contains no frames",
            path.display()
        )));
    }
    Ok(frames.into_iter().map(|f| f.into_buffer()).collect())
}
