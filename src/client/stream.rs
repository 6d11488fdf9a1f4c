use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _, BufReader},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{FrameSink, guarded},
    codec::rgb565,
    config::ClientConfig,
    foundation::{
        core::Resolution,
        error::{FramecastError, FramecastResult},
    },
    protocol::{MAX_LINE_LEN, Reply, StreamInfo, StreamRequest, read_frame_len, read_line},
};

/// How a client run ended when it did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every frame through the announced upper bound was delivered.
    Completed { name: String, next_frame: u32 },
    Cancelled { next_frame: u32 },
}

/// Resumable stream client.
///
/// Across reconnects it remembers the asset in progress and the next frame it needs, so a
/// dropped connection costs neither a repeated nor a skipped frame. Only a name the caller
/// pinned goes back to the server; an unpinned client lets the server choose again and starts
/// over at frame 0 when the choice changes.
#[derive(Clone, Debug)]
pub struct StreamClient {
    cfg: ClientConfig,
    resolution: Resolution,
    name: Option<String>,
    from: Option<u32>,
    to: Option<u32>,
}

/// What survives between connection attempts.
#[derive(Debug)]
struct Progress {
    /// Set by the first `INFO` reply of the run.
    started: bool,
    name: Option<String>,
    next_frame: u32,
}

enum AttemptEnd {
    Completed,
    Cancelled,
}

impl StreamClient {
    pub fn new(cfg: ClientConfig) -> FramecastResult<Self> {
        let resolution = Resolution::new(cfg.width, cfg.height)?;
        Ok(Self {
            cfg,
            resolution,
            name: None,
            from: None,
            to: None,
        })
    }

    /// Ask for a specific asset instead of letting the server choose.
    pub fn with_asset(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_range(mut self, from: Option<u32>, to: Option<u32>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    /// Stream until the announced range is delivered, retries run out, or `cancel` fires.
    pub async fn run<S: FrameSink>(
        &self,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> FramecastResult<StreamOutcome> {
        let mut progress = Progress {
            started: false,
            name: None,
            next_frame: self.from.unwrap_or(0),
        };
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(StreamOutcome::Cancelled {
                    next_frame: progress.next_frame,
                });
            }
            if retries >= self.cfg.max_retries {
                tracing::warn!(attempts = retries, "stream failed, giving up");
                return Err(FramecastError::RetriesExhausted { attempts: retries });
            }

            tracing::info!(
                attempt = retries + 1,
                max = self.cfg.max_retries,
                next_frame = progress.next_frame,
                "connecting"
            );
            match self.attempt(sink, &mut progress, retries, cancel).await {
                Ok(AttemptEnd::Completed) => {
                    sink.end()?;
                    return Ok(StreamOutcome::Completed {
                        name: progress.name.unwrap_or_default(),
                        next_frame: progress.next_frame,
                    });
                }
                Ok(AttemptEnd::Cancelled) => {
                    return Ok(StreamOutcome::Cancelled {
                        next_frame: progress.next_frame,
                    });
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    retries += 1;
                    tracing::warn!(
                        retries,
                        next_frame = progress.next_frame,
                        error = %err,
                        "stream attempt failed"
                    );
                }
            }
        }
    }

    fn request(&self, progress: &Progress) -> StreamRequest {
        StreamRequest {
            resolution: self.resolution,
            from: Some(progress.next_frame),
            to: self.to,
            name: self.name.clone(),
        }
    }

    async fn attempt<S: FrameSink>(
        &self,
        sink: &mut S,
        progress: &mut Progress,
        retries: u32,
        cancel: &CancellationToken,
    ) -> FramecastResult<AttemptEnd> {
        let addr = self.cfg.server_addr();
        let connect = async { Ok::<_, FramecastError>(TcpStream::connect(&addr).await?) };
        let Some(stream) = guarded(cancel, self.cfg.connect_timeout(), "connect", connect).await?
        else {
            return Ok(AttemptEnd::Cancelled);
        };
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);

        let request = self.request(progress);
        tracing::debug!(request = %request, "sending request");
        wr.write_all(request.to_line().as_bytes()).await?;

        let reply = guarded(
            cancel,
            self.cfg.reply_timeout(),
            "reply",
            read_line(&mut rd, MAX_LINE_LEN),
        )
        .await?;
        let info = match reply {
            None => return Ok(AttemptEnd::Cancelled),
            Some(None) => return Err(FramecastError::protocol("server closed without a reply")),
            Some(Some(line)) => match Reply::parse(&line)? {
                Reply::Info(info) => info,
                Reply::Error(message) => {
                    return Err(FramecastError::protocol(format!("server refused: {message}")));
                }
            },
        };
        self.adopt(progress, &info)?;
        sink.begin(&info).map_err(sink_error)?;
        tracing::info!(
            name = %info.name,
            n_frames = info.n_frames,
            from = progress.next_frame,
            to = info.span.to,
            "streaming"
        );

        let frame_len = self.resolution.frame_len();
        let read_timeout = self.cfg.read_timeout(retries);
        let mut payload = vec![0u8; frame_len];
        while progress.next_frame <= info.span.to {
            if cancel.is_cancelled() {
                return Ok(AttemptEnd::Cancelled);
            }
            let header = guarded(
                cancel,
                read_timeout,
                "frame header",
                read_frame_len(&mut rd, frame_len),
            )
            .await?;
            if header.is_none() {
                return Ok(AttemptEnd::Cancelled);
            }
            let body = async {
                rd.read_exact(&mut payload).await?;
                Ok::<_, FramecastError>(())
            };
            if guarded(cancel, read_timeout, "frame payload", body)
                .await?
                .is_none()
            {
                return Ok(AttemptEnd::Cancelled);
            }

            let rgb = rgb565::unpack_to_rgb8(&payload)?;
            sink.push_frame(progress.next_frame, &rgb)
                .map_err(sink_error)?;
            progress.next_frame += 1;
            tokio::task::yield_now().await;
        }
        Ok(AttemptEnd::Completed)
    }

    /// Reconcile local progress with what the server announced.
    fn adopt(&self, progress: &mut Progress, info: &StreamInfo) -> FramecastResult<()> {
        if info.resolution != self.resolution {
            return Err(FramecastError::protocol(format!(
                "server announced {}, requested {}",
                info.resolution, self.resolution
            )));
        }
        if !progress.started {
            // First contact: the server may have clamped the starting frame.
            progress.started = true;
            progress.name = Some(info.name.clone());
            progress.next_frame = info.span.from;
        } else if progress.name.as_deref() != Some(info.name.as_str()) {
            tracing::info!(
                from = progress.name.as_deref().unwrap_or_default(),
                to = %info.name,
                "asset changed, restarting at frame 0"
            );
            progress.name = Some(info.name.clone());
            progress.next_frame = 0;
        }
        if info.span.from != progress.next_frame {
            return Err(FramecastError::protocol(format!(
                "server resumed at frame {}, expected {}",
                info.span.from, progress.next_frame
            )));
        }
        Ok(())
    }
}

/// Sink failures end the run instead of triggering a reconnect.
fn sink_error(err: FramecastError) -> FramecastError {
    match err {
        FramecastError::Client(_) => err,
        other => FramecastError::client(other.to_string()),
    }
}
