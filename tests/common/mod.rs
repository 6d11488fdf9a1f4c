#![allow(dead_code)]

use std::{fs::File, path::Path, sync::Arc, time::Duration};

use framecast::{CacheScanner, MetadataStore, ScannerConfig};
use image::{Delay, Frame, Rgba, RgbaImage, codecs::gif::GifEncoder};

/// Write an animated GIF with one solid-colour frame per entry in `colors`.
pub fn write_gif(path: &Path, w: u32, h: u32, colors: &[[u8; 3]]) {
    let f = File::create(path).unwrap();
    let mut enc = GifEncoder::new(f);
    let frames = colors.iter().map(|c| {
        let img = RgbaImage::from_pixel(w, h, Rgba([c[0], c[1], c[2], 255]));
        Frame::from_parts(img, 0, 0, Delay::from_numer_denom_ms(100, 1))
    });
    enc.encode_frames(frames).unwrap();
}

/// `n` distinguishable frame colours.
pub fn ramp(n: u32) -> Vec<[u8; 3]> {
    (0..n)
        .map(|i| {
            let v = (i * 6 % 256) as u8;
            [v, 255 - v, (i * 40 % 256) as u8]
        })
        .collect()
}

pub fn scanner_config(root: &Path, cache_limit: usize) -> ScannerConfig {
    ScannerConfig {
        source_dir: root.join("gifs"),
        cache_root: root.join("cache"),
        cache_limit,
        scan_interval_secs: 300,
        stale_secs: 3600,
    }
}

/// A scanner over `<root>/gifs` and `<root>/cache`, with an in-memory catalog.
pub fn scanner(root: &Path, cache_limit: usize) -> CacheScanner {
    let cfg = scanner_config(root, cache_limit);
    std::fs::create_dir_all(&cfg.source_dir).unwrap();
    CacheScanner::new(Arc::new(MetadataStore::in_memory().unwrap()), cfg)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
