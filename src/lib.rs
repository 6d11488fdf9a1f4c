#![forbid(unsafe_code)]

//! LAN streaming of pre-rendered animations to small LED matrix clients.
//!
//! A [`CacheScanner`] keeps the [`MetadataStore`] catalog in step with a directory of GIF
//! sources and pre-decodes a bounded, rotating set of them per resolution into a [`CacheDir`].
//! A [`StreamServer`] answers `STREAM` and `QRCLOCK` requests with length-prefixed RGB565
//! frames, from the cache when it can and by decoding on the fly when it cannot. A
//! [`StreamClient`] consumes those frames and resumes exactly where it left off after a dropped
//! connection.

pub mod cache_dir;
pub mod client;
pub mod codec;
pub mod config;
pub mod foundation;
pub mod protocol;
pub mod scanner;
pub mod server;
pub mod store;

pub use cache_dir::CacheDir;
pub use client::{
    ClockClient, CountingSink, FrameSink, InMemorySink, PngSink, StreamClient, StreamOutcome,
};
pub use codec::{FrameCodec, SourceInfo};
pub use config::{ClientConfig, Config, ScannerConfig, ServerConfig, StoreConfig};
pub use foundation::core::{FrameSpan, Resolution};
pub use foundation::error::{FramecastError, FramecastResult};
pub use protocol::{ClockRequest, Reply, Request, StreamInfo, StreamRequest};
pub use scanner::{CacheScanner, PassReport, ScannerHandle};
pub use server::StreamServer;
pub use store::MetadataStore;
