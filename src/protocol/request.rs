use std::{fmt, str::FromStr};

use crate::foundation::{
    core::Resolution,
    error::{FramecastError, FramecastResult},
};

/// Clock offsets must stay strictly inside `±MAX_CLOCK_OFFSET_HOURS`.
const MAX_CLOCK_OFFSET_HOURS: f64 = 24.0;

/// A parsed command line.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Stream(StreamRequest),
    Clock(ClockRequest),
}

/// `STREAM:<w>:<h>:<from>-<to>[:<name>]`
///
/// `None` bounds mean "from 0" and "to the last frame"; `None` name lets the server pick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub resolution: Resolution,
    pub from: Option<u32>,
    pub to: Option<u32>,
    pub name: Option<String>,
}

/// `QRCLOCK:<utcOffsetHours>`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockRequest {
    pub offset_hours: f64,
}

impl Request {
    /// Parse one command line; a trailing newline is ignored.
    pub fn parse(line: &str) -> FramecastResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix("STREAM:") {
            return parse_stream(rest).map(Self::Stream);
        }
        if line == "QRCLOCK" {
            return Ok(Self::Clock(ClockRequest { offset_hours: 0.0 }));
        }
        if let Some(rest) = line.strip_prefix("QRCLOCK:") {
            return parse_clock(rest).map(Self::Clock);
        }
        Err(malformed(line))
    }
}

impl FromStr for Request {
    type Err = FramecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn malformed(line: &str) -> FramecastError {
    FramecastError::protocol(format!("malformed command '{line}'"))
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_bound(s: &str) -> Result<Option<u32>, ()> {
    if s.is_empty() {
        return Ok(None);
    }
    parse_digits(s).map(Some).ok_or(())
}

fn parse_stream(rest: &str) -> FramecastResult<StreamRequest> {
    let line = || format!("STREAM:{rest}");
    let mut parts = rest.splitn(4, ':');
    let (Some(w), Some(h), Some(range)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(malformed(&line()));
    };
    let name = parts.next().filter(|n| !n.is_empty()).map(str::to_string);

    let (Some(width), Some(height)) = (parse_digits(w), parse_digits(h)) else {
        return Err(malformed(&line()));
    };
    let resolution = Resolution::new(width, height).map_err(|_| malformed(&line()))?;

    let (from, to) = match range.split_once('-') {
        Some((f, t)) => match (parse_bound(f), parse_bound(t)) {
            (Ok(from), Ok(to)) => (from, to),
            _ => return Err(malformed(&line())),
        },
        None if range.is_empty() => (None, None),
        None => match parse_digits(range) {
            Some(from) => (Some(from), None),
            None => return Err(malformed(&line())),
        },
    };

    Ok(StreamRequest {
        resolution,
        from,
        to,
        name,
    })
}

fn parse_clock(rest: &str) -> FramecastResult<ClockRequest> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Ok(ClockRequest { offset_hours: 0.0 });
    }
    match rest.parse::<f64>() {
        Ok(h) if h.is_finite() && h.abs() < MAX_CLOCK_OFFSET_HOURS => {
            Ok(ClockRequest { offset_hours: h })
        }
        _ => Err(malformed(&format!("QRCLOCK:{rest}"))),
    }
}

impl StreamRequest {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            from: None,
            to: None,
            name: None,
        }
    }

    /// The request as sent on the wire, newline included.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STREAM:{}:{}:",
            self.resolution.width, self.resolution.height
        )?;
        if let Some(from) = self.from {
            write!(f, "{from}")?;
        }
        f.write_str("-")?;
        if let Some(to) = self.to {
            write!(f, "{to}")?;
        }
        if let Some(name) = &self.name {
            write!(f, ":{name}")?;
        }
        Ok(())
    }
}

impl ClockRequest {
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for ClockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QRCLOCK:{}", self.offset_hours)
    }
}
