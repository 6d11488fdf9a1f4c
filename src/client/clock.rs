use tokio::{io::AsyncWriteExt as _, net::TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{FrameSink, guarded},
    codec::rgb565,
    config::ClientConfig,
    foundation::{
        core::{FrameSpan, Resolution},
        error::{FramecastError, FramecastResult},
    },
    protocol::{ClockRequest, StreamInfo, read_frame},
};

/// Name reported to sinks for clock frames.
pub const CLOCK_STREAM_NAME: &str = "qrclock";

/// Receives QR clock frames. The clock sub-protocol has no reply line and no resume, so a
/// failure simply ends the run.
#[derive(Clone, Debug)]
pub struct ClockClient {
    cfg: ClientConfig,
    offset_hours: f64,
    size: u32,
}

impl ClockClient {
    pub fn new(cfg: ClientConfig, offset_hours: f64, size: u32) -> FramecastResult<Self> {
        Resolution::new(size, size)?;
        Ok(Self {
            cfg,
            offset_hours,
            size,
        })
    }

    /// Receive up to `ticks` frames; returns how many arrived before the server stopped or
    /// `cancel` fired.
    pub async fn run<S: FrameSink>(
        &self,
        sink: &mut S,
        ticks: u32,
        cancel: &CancellationToken,
    ) -> FramecastResult<u32> {
        if ticks == 0 {
            return Ok(0);
        }
        let res = Resolution::new(self.size, self.size)?;
        let addr = self.cfg.server_addr();
        let connect = async { Ok::<_, FramecastError>(TcpStream::connect(&addr).await?) };
        let Some(mut stream) =
            guarded(cancel, self.cfg.connect_timeout(), "connect", connect).await?
        else {
            return Ok(0);
        };
        let request = ClockRequest {
            offset_hours: self.offset_hours,
        };
        stream.write_all(request.to_line().as_bytes()).await?;

        sink.begin(&StreamInfo {
            resolution: res,
            span: FrameSpan {
                from: 0,
                to: ticks - 1,
            },
            name: CLOCK_STREAM_NAME.to_string(),
            n_frames: ticks,
        })?;

        // Frames arrive once a second, on top of the usual read allowance.
        let limit = self.cfg.read_timeout(0) + std::time::Duration::from_secs(1);
        let mut received = 0u32;
        while received < ticks {
            let frame = guarded(
                cancel,
                limit,
                "clock frame",
                read_frame(&mut stream, res.frame_len()),
            )
            .await?;
            let Some(frame) = frame else {
                break;
            };
            sink.push_frame(received, &rgb565::unpack_to_rgb8(&frame)?)?;
            received += 1;
        }
        sink.end()?;
        Ok(received)
    }
}
