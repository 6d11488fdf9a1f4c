use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use image::{Rgb, RgbImage};
use qrcode::{Color, EcLevel, QrCode};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::rgb565,
    foundation::error::{FramecastError, FramecastResult},
    protocol::{ClockRequest, write_frame},
    server::{Shared, send_with_timeout, session::refuse},
};

/// Quiet zone kept around the code on every side, in pixels.
const CLOCK_BORDER: u32 = 2;
const CLOCK_TICK: Duration = Duration::from_secs(1);
const CLOCK_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const CLOCK_UNAVAILABLE: &str = "Clock unavailable";

/// Render `now` shifted by `offset_hours` as a QR code centered in a black `size`×`size` frame,
/// one pixel per module, white modules. Returns the packed frame and the encoded text.
pub fn clock_frame(
    now: DateTime<Utc>,
    offset_hours: f64,
    size: u32,
) -> FramecastResult<(Vec<u8>, String)> {
    let offset_secs = (offset_hours * 3600.0).round();
    let offset = FixedOffset::east_opt(offset_secs as i32).ok_or_else(|| {
        FramecastError::validation(format!("utc offset {offset_hours}h out of range"))
    })?;
    let text = now.with_timezone(&offset).format(CLOCK_FORMAT).to_string();

    let code = QrCode::with_error_correction_level(text.as_bytes(), EcLevel::L)
        .map_err(|err| FramecastError::codec(format!("qr encode '{text}': {err}")))?;
    let modules = u32::try_from(code.width())
        .map_err(|_| FramecastError::codec("qr code width overflow"))?;
    if modules + 2 * CLOCK_BORDER > size {
        return Err(FramecastError::codec(format!(
            "qr code of {modules} modules does not fit a {size}px clock"
        )));
    }

    let mut img = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
    let origin = (size - modules) / 2;
    for (i, color) in code.to_colors().into_iter().enumerate() {
        if color == Color::Dark {
            let i = i as u32;
            img.put_pixel(origin + i % modules, origin + i / modules, Rgb([255, 255, 255]));
        }
    }
    let packed = rgb565::pack_rgb8(img.as_raw())?;
    Ok((packed, text))
}

/// Send one clock frame per second until the tick bound, a send failure, or shutdown.
///
/// A clock that cannot render its first frame is refused with an `ERROR` line.
pub(crate) async fn serve_clock<W>(
    shared: &Shared,
    wr: &mut W,
    req: ClockRequest,
    cancel: &CancellationToken,
) -> FramecastResult<()>
where
    W: AsyncWrite + Unpin,
{
    let size = shared.cfg.clock_size;
    let mut ticks = 0u32;
    while ticks < shared.cfg.clock_max_ticks {
        let (frame, text) = match clock_frame(Utc::now(), req.offset_hours, size) {
            Ok(rendered) => rendered,
            Err(err) if ticks == 0 => {
                tracing::warn!(offset = req.offset_hours, size, error = %err, "refusing clock");
                return refuse(shared, wr, CLOCK_UNAVAILABLE).await;
            }
            Err(err) => return Err(err),
        };
        let sent = send_with_timeout(shared.cfg.command_timeout(), write_frame(wr, &frame)).await;
        if let Err(err) = sent {
            tracing::debug!(error = %err, "clock client went away");
            break;
        }
        tracing::trace!(%text, "clock tick");
        ticks += 1;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(CLOCK_TICK) => {}
        }
    }
    tracing::info!(ticks, "clock stream ended");
    Ok(())
}
