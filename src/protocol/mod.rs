//! The line-plus-frames wire protocol shared by server and client.
//!
//! A connection carries one request line, then either one reply line followed by
//! length-prefixed RGB565 frames, or (for the clock) frames only.

mod framing;
mod reply;
mod request;

pub use framing::{FRAME_HEADER_LEN, read_frame, read_frame_len, read_line, write_frame};
pub use reply::{Reply, StreamInfo};
pub use request::{ClockRequest, Request, StreamRequest};

/// Longest command or reply line either side will read.
pub const MAX_LINE_LEN: usize = 1024;
