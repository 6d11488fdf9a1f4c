//! TCP front end: one task per connection, frames served from the disk cache or decoded on the
//! fly.

mod clock;
mod session;

use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    cache_dir::CacheDir,
    codec::FrameCodec,
    config::ServerConfig,
    foundation::error::{FramecastError, FramecastResult},
    store::MetadataStore,
};

pub use clock::clock_frame;

/// State every connection handler reads.
pub(crate) struct Shared {
    store: Arc<MetadataStore>,
    cache: CacheDir,
    codec: FrameCodec,
    source_dir: PathBuf,
    cfg: ServerConfig,
}

impl Shared {
    /// Run a catalog operation on the blocking pool. SQLite and filesystem calls never run on a
    /// connection task.
    pub(crate) async fn with_store<T, F>(&self, op: F) -> FramecastResult<T>
    where
        F: FnOnce(&MetadataStore) -> FramecastResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| FramecastError::store(format!("catalog task failed: {err}")))?
    }
}

pub struct StreamServer {
    shared: Arc<Shared>,
}

impl StreamServer {
    pub fn new(
        store: Arc<MetadataStore>,
        cache: CacheDir,
        source_dir: impl Into<PathBuf>,
        cfg: ServerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                cache,
                codec: FrameCodec::new(),
                source_dir: source_dir.into(),
                cfg,
            }),
        }
    }

    /// Bind the configured host and port.
    pub async fn bind(&self) -> FramecastResult<TcpListener> {
        let addr = self.shared.cfg.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        Ok(listener)
    }

    /// Accept connections until `cancel` fires, then wait for open connections to wind down.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> FramecastResult<()> {
        let local = listener.local_addr()?;
        tracing::info!(
            addr = %local,
            source_dir = %self.shared.source_dir.display(),
            cache_root = %self.shared.cache.root().display(),
            fps = self.shared.cfg.target_fps,
            "stream server listening"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let shared = Arc::clone(&self.shared);
                        let conn_cancel = cancel.child_token();
                        connections.spawn(handle_connection(shared, socket, peer, conn_cancel));
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        tracing::info!(open = connections.len(), "stream server shutting down");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    socket: tokio::net::TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    tracing::debug!(%peer, "new connection");
    if let Err(err) = session::handle(&shared, socket, peer, &cancel).await {
        tracing::warn!(%peer, error = %err, "connection failed");
    }
    tracing::debug!(%peer, "connection closed");
}

/// Bound a single send; a client that stops reading is treated like one that disconnected.
pub(crate) async fn send_with_timeout<F>(limit: Duration, send: F) -> FramecastResult<()>
where
    F: Future<Output = FramecastResult<()>>,
{
    match tokio::time::timeout(limit, send).await {
        Ok(sent) => sent,
        Err(_) => Err(FramecastError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "send timed out",
        ))),
    }
}
