//! Device-side receivers: a resumable stream client and a QR clock client.

mod clock;
mod sink;
mod stream;

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::foundation::error::{FramecastError, FramecastResult};

pub use clock::{CLOCK_STREAM_NAME, ClockClient};
pub use sink::{CountingSink, FrameSink, InMemorySink, PngSink};
pub use stream::{StreamClient, StreamOutcome};

/// Run one suspension point with a deadline, giving up early if `cancel` fires.
///
/// `Ok(None)` means cancelled; a missed deadline is an I/O timeout error.
pub(crate) async fn guarded<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    what: &str,
    fut: F,
) -> FramecastResult<Option<T>>
where
    F: Future<Output = FramecastResult<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        outcome = tokio::time::timeout(limit, fut) => match outcome {
            Ok(value) => value.map(Some),
            Err(_) => Err(FramecastError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{what} timed out after {limit:?}"),
            ))),
        },
    }
}
