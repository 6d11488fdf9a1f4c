use std::fmt;

use crate::foundation::{
    core::{FrameSpan, Resolution},
    error::{FramecastError, FramecastResult},
};

/// What the server is about to stream, announced before the first frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub resolution: Resolution,
    pub span: FrameSpan,
    pub name: String,
    /// Total frames in the asset, not just in the span.
    pub n_frames: u32,
}

/// The single line a server answers a stream request with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Info(StreamInfo),
    Error(String),
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }

    /// Parse an `INFO:` or `ERROR:` line. The asset name may itself contain colons.
    pub fn parse(line: &str) -> FramecastResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(message) = line.strip_prefix("ERROR:") {
            return Ok(Self::Error(message.to_string()));
        }
        let bad = || FramecastError::protocol(format!("malformed reply '{line}'"));
        let rest = line.strip_prefix("INFO:").ok_or_else(bad)?;

        let (head, n_frames) = rest.rsplit_once(':').ok_or_else(bad)?;
        let mut parts = head.splitn(4, ':');
        let (Some(w), Some(h), Some(range), Some(name)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        let (from, to) = range.split_once('-').ok_or_else(bad)?;
        let num = |s: &str| -> FramecastResult<u32> {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad());
            }
            s.parse().map_err(|_| bad())
        };

        let resolution = Resolution::new(num(w)?, num(h)?).map_err(|_| bad())?;
        let span = FrameSpan {
            from: num(from)?,
            to: num(to)?,
        };
        let n_frames = num(n_frames)?;
        if name.is_empty() || span.from > span.to || span.to >= n_frames {
            return Err(bad());
        }
        Ok(Self::Info(StreamInfo {
            resolution,
            span,
            name: name.to_string(),
            n_frames,
        }))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info(info) => write!(
                f,
                "INFO:{}:{}:{}:{}:{}",
                info.resolution.width, info.resolution.height, info.span, info.name, info.n_frames
            ),
            Self::Error(message) => write!(f, "ERROR:{message}"),
        }
    }
}
