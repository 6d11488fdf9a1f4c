//! Source animation decoding and RGB565 frame packing.

mod decode;
pub mod rgb565;

pub use decode::{FrameCodec, SourceInfo};
