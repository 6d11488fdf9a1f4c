use std::{borrow::Cow, net::SocketAddr, time::Instant};

use chrono::Utc;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt as _, BufReader},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cache_dir::CacheDir,
    foundation::{
        core::{FrameSpan, Resolution},
        error::{FramecastError, FramecastResult},
    },
    protocol::{MAX_LINE_LEN, Reply, Request, StreamInfo, StreamRequest, read_line, write_frame},
    server::{Shared, clock, send_with_timeout},
    store::{AssetRecord, CacheEntry, CacheEntryId, NewSession, PlaybackStats, SessionId},
};

const INVALID_COMMAND: &str = "Invalid command";
const NO_ANIMATIONS: &str = "No suitable animations available";

pub(crate) async fn handle(
    shared: &Shared,
    socket: TcpStream,
    peer: SocketAddr,
    cancel: &CancellationToken,
) -> FramecastResult<()> {
    let (rd, mut wr) = socket.into_split();
    let mut rd = BufReader::new(rd);

    let line =
        match tokio::time::timeout(shared.cfg.command_timeout(), read_line(&mut rd, MAX_LINE_LEN))
            .await
        {
            Err(_) => {
                tracing::debug!(%peer, "no command before timeout");
                return Ok(());
            }
            Ok(Ok(None)) => {
                tracing::debug!(%peer, "disconnected without a command");
                return Ok(());
            }
            Ok(Ok(Some(line))) => line,
            Ok(Err(err)) => {
                tracing::info!(%peer, error = %err, "unreadable command");
                return refuse(shared, &mut wr, INVALID_COMMAND).await;
            }
        };
    tracing::info!(%peer, command = %line, "received command");

    match Request::parse(&line) {
        Ok(Request::Stream(req)) => serve_stream(shared, &mut wr, peer, &line, req, cancel).await,
        Ok(Request::Clock(req)) => clock::serve_clock(shared, &mut wr, req, cancel).await,
        Err(err) => {
            tracing::info!(%peer, error = %err, "invalid command");
            refuse(shared, &mut wr, INVALID_COMMAND).await
        }
    }
}

pub(super) async fn refuse<W>(shared: &Shared, wr: &mut W, message: &str) -> FramecastResult<()>
where
    W: AsyncWrite + Unpin,
{
    let line = Reply::error(message).to_line();
    send_with_timeout(shared.cfg.command_timeout(), async {
        wr.write_all(line.as_bytes()).await?;
        wr.shutdown().await?;
        Ok::<_, FramecastError>(())
    })
    .await
}

/// Pick the asset a request refers to, or the error line to answer with.
async fn resolve_asset(
    shared: &Shared,
    req: &StreamRequest,
) -> FramecastResult<Result<AssetRecord, String>> {
    let source_dir = shared.source_dir.clone();
    let name = req.name.clone();
    let res = req.resolution;
    shared
        .with_store(move |store| {
            let has_source = |a: &AssetRecord| source_dir.join(&a.filename).is_file();
            Ok(match name {
                Some(name) => store
                    .asset_by_name(&name)?
                    .filter(has_source)
                    .ok_or_else(|| format!("Animation '{name}' not found")),
                None => store
                    .least_played(res, 1)?
                    .into_iter()
                    .next()
                    .filter(has_source)
                    .ok_or_else(|| NO_ANIMATIONS.to_string()),
            })
        })
        .await
}

/// Log an accepted request and count the play against its asset.
///
/// Runs after `INFO` went out. Failures are logged and never abort the transfer; a stream whose
/// session row could not be written runs without one.
async fn open_session(shared: &Shared, session: NewSession) -> Option<SessionId> {
    let asset_id = session.asset_id;
    let logged = shared
        .with_store(move |store| {
            let id = store.begin_session(session, Utc::now())?;
            if let Err(err) = store.record_play(asset_id, Utc::now()) {
                tracing::warn!(asset_id = asset_id.0, error = %err, "play not counted");
            }
            Ok(id)
        })
        .await;
    match logged {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::warn!(asset_id = asset_id.0, error = %err, "session not logged");
            None
        }
    }
}

async fn finish_session(
    shared: &Shared,
    session: SessionId,
    stats: PlaybackStats,
) -> FramecastResult<()> {
    shared
        .with_store(move |store| store.finish_session(session, stats.frames_sent, stats.fps))
        .await
}

/// Register as a reader of the cached frames for (asset, res), if they can serve `min_frames`.
async fn acquire_cached(
    shared: &Shared,
    asset: &AssetRecord,
    res: Resolution,
    min_frames: u32,
) -> FramecastResult<Option<CacheEntry>> {
    let asset = asset.clone();
    let cache = shared.cache.clone();
    shared
        .with_store(move |store| {
            let Some(entry) = store.acquire_playback(&asset, res, min_frames)? else {
                return Ok(None);
            };
            if cache.has_asset(res, &asset.name) {
                return Ok(Some(entry));
            }
            store.release_playback(entry.id, None, Utc::now())?;
            Ok(None)
        })
        .await
}

async fn release_cached(
    shared: &Shared,
    entry: CacheEntryId,
    served: Option<PlaybackStats>,
) -> FramecastResult<()> {
    shared
        .with_store(move |store| store.release_playback(entry, served, Utc::now()))
        .await
}

async fn serve_stream<W>(
    shared: &Shared,
    wr: &mut W,
    peer: SocketAddr,
    line: &str,
    req: StreamRequest,
    cancel: &CancellationToken,
) -> FramecastResult<()>
where
    W: AsyncWrite + Unpin,
{
    let res = req.resolution;
    let asset = match resolve_asset(shared, &req).await? {
        Ok(asset) => asset,
        Err(message) => {
            tracing::info!(%peer, %res, reason = %message, "refusing stream");
            return refuse(shared, wr, &message).await;
        }
    };
    let span = match FrameSpan::clamp(req.from, req.to, asset.n_frames) {
        Ok(span) => span,
        Err(err) => {
            tracing::warn!(%peer, asset = %asset.name, error = %err, "refusing stream");
            let message = format!("Animation '{}' has no frames", asset.name);
            return refuse(shared, wr, &message).await;
        }
    };

    let info = Reply::Info(StreamInfo {
        resolution: res,
        span,
        name: asset.name.clone(),
        n_frames: asset.n_frames,
    })
    .to_line();
    send_with_timeout(shared.cfg.command_timeout(), async {
        wr.write_all(info.as_bytes()).await?;
        Ok::<_, FramecastError>(())
    })
    .await?;
    tracing::info!(%peer, info = info.trim_end(), "accepted stream");

    let session = open_session(
        shared,
        NewSession {
            client_addr: peer.ip().to_string(),
            asset_id: asset.id,
            request: line.to_string(),
            frame_from: span.from,
            frame_to: span.to,
            resolution: res,
        },
    )
    .await;

    let cached = acquire_cached(shared, &asset, res, span.to + 1)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(%peer, asset = %asset.name, error = %err, "cache lookup failed");
            None
        });
    let (stats, source) = match cached {
        Some(entry) => {
            let source = FrameSource::Cached {
                cache: &shared.cache,
                res,
                name: &asset.name,
            };
            let stats = pump(shared, wr, &source, span, cancel).await;
            let served = (stats.frames_sent > 0).then_some(stats);
            if let Err(err) = release_cached(shared, entry.id, served).await {
                tracing::warn!(%peer, asset = %asset.name, error = %err, "cache entry not released");
            }
            (stats, "cache")
        }
        None => {
            let stats = match decode(shared, &asset, res).await {
                Ok(frames) => pump(shared, wr, &FrameSource::Decoded(frames), span, cancel).await,
                Err(err) => {
                    tracing::error!(
                        %peer, asset = %asset.name, error = %err,
                        "on-the-fly decode failed"
                    );
                    PlaybackStats {
                        frames_sent: 0,
                        fps: 0.0,
                    }
                }
            };
            (stats, "decode")
        }
    };

    if let Some(session) = session {
        finish_session(shared, session, stats).await?;
    }
    tracing::info!(
        %peer,
        asset = %asset.name,
        source,
        frames_sent = stats.frames_sent,
        requested = span.len_frames(),
        fps = stats.fps,
        "stream finished"
    );
    Ok(())
}

async fn decode(
    shared: &Shared,
    asset: &AssetRecord,
    res: Resolution,
) -> FramecastResult<Vec<Vec<u8>>> {
    let codec = shared.codec;
    let path = shared.source_dir.join(&asset.filename);
    tokio::task::spawn_blocking(move || codec.decode_packed(&path, res))
        .await
        .map_err(|err| FramecastError::codec(format!("decode task failed: {err}")))?
}

enum FrameSource<'a> {
    Cached {
        cache: &'a CacheDir,
        res: Resolution,
        name: &'a str,
    },
    Decoded(Vec<Vec<u8>>),
}

impl FrameSource<'_> {
    async fn frame(&self, index: u32) -> Option<Cow<'_, [u8]>> {
        match self {
            Self::Cached { cache, res, name } => {
                let path = cache.frame_path(*res, name, index);
                match tokio::fs::read(&path).await {
                    Ok(bytes) if bytes.len() == res.frame_len() => Some(Cow::Owned(bytes)),
                    Ok(bytes) => {
                        tracing::warn!(
                            path = %path.display(), len = bytes.len(),
                            "truncated cached frame"
                        );
                        None
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "missing cached frame");
                        None
                    }
                }
            }
            Self::Decoded(frames) => frames.get(index as usize).map(|f| Cow::Borrowed(f.as_slice())),
        }
    }
}

/// Send `span` at the configured rate. Stops early, without error, when a frame is unavailable,
/// the client goes away, or the server shuts down.
async fn pump<W>(
    shared: &Shared,
    wr: &mut W,
    source: &FrameSource<'_>,
    span: FrameSpan,
    cancel: &CancellationToken,
) -> PlaybackStats
where
    W: AsyncWrite + Unpin,
{
    let interval = shared.cfg.frame_interval();
    let send_limit = shared.cfg.command_timeout();
    let started = Instant::now();
    let mut frames_sent = 0u32;

    for index in span.from..=span.to {
        if cancel.is_cancelled() {
            break;
        }
        let Some(frame) = source.frame(index).await else {
            break;
        };
        if let Err(err) = send_with_timeout(send_limit, write_frame(wr, &frame)).await {
            tracing::debug!(index, error = %err, "client disconnected mid-stream");
            break;
        }
        frames_sent += 1;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    let elapsed = started.elapsed().as_secs_f64().max(1e-6);
    PlaybackStats {
        frames_sent,
        fps: f64::from(frames_sent) / elapsed,
    }
}
