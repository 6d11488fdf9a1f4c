use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;

use crate::foundation::{core::Resolution, error::FramecastResult};

/// On-disk frame cache: `<root>/<w>x<h>/<asset name>/frame_<NNNN>.bin`, one packed frame per file.
#[derive(Clone, Debug)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolution_dir(&self, res: Resolution) -> PathBuf {
        self.root.join(res.to_string())
    }

    pub fn asset_dir(&self, res: Resolution, asset_name: &str) -> PathBuf {
        self.resolution_dir(res).join(asset_name)
    }

    pub fn frame_path(&self, res: Resolution, asset_name: &str, index: u32) -> PathBuf {
        self.asset_dir(res, asset_name).join(frame_file_name(index))
    }

    pub fn has_asset(&self, res: Resolution, asset_name: &str) -> bool {
        self.asset_dir(res, asset_name).is_dir()
    }

    /// Replace whatever is cached for (res, asset) with `frames`; returns the frame count written.
    pub fn write_frames(
        &self,
        res: Resolution,
        asset_name: &str,
        frames: &[Vec<u8>],
    ) -> FramecastResult<u32> {
        let dir = self.asset_dir(res, asset_name);
        if dir.exists() {
            self.remove_asset(res, asset_name)?;
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("create cache dir '{}'", dir.display()))?;
        for (idx, frame) in frames.iter().enumerate() {
            let path = dir.join(frame_file_name(idx as u32));
            fs::write(&path, frame).with_context(|| format!("write '{}'", path.display()))?;
        }
        Ok(frames.len() as u32)
    }

    /// Delete every frame file, then the directory itself. Missing directories are fine.
    pub fn remove_asset(&self, res: Resolution, asset_name: &str) -> FramecastResult<()> {
        let dir = self.asset_dir(res, asset_name);
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir).with_context(|| format!("list '{}'", dir.display()))? {
            let path = entry?.path();
            let is_frame = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("frame_") && n.ends_with(".bin"));
            if is_frame {
                fs::remove_file(&path).with_context(|| format!("remove '{}'", path.display()))?;
            }
        }
        fs::remove_dir(&dir).with_context(|| format!("remove dir '{}'", dir.display()))?;
        Ok(())
    }
}

fn frame_file_name(index: u32) -> String {
    format!("frame_{index:04}.bin")
}
