use tokio::io::{
    AsyncBufRead, AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _, AsyncWrite,
    AsyncWriteExt as _,
};

use crate::foundation::error::{FramecastError, FramecastResult};

/// Length prefix size: one big-endian `u32`.
pub const FRAME_HEADER_LEN: usize = 4;

/// Write one length-prefixed frame.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> FramecastResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| FramecastError::protocol("frame larger than 4 GiB"))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(payload).await?;
    Ok(())
}

/// Read a frame header and require it to announce exactly `expected` bytes.
pub async fn read_frame_len<R>(r: &mut R, expected: usize) -> FramecastResult<usize>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    r.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len != expected {
        return Err(FramecastError::protocol(format!(
            "unexpected frame size {len}, expected {expected}"
        )));
    }
    Ok(len)
}

/// Read one complete frame of exactly `expected` payload bytes.
pub async fn read_frame<R>(r: &mut R, expected: usize) -> FramecastResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = read_frame_len(r, expected).await?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Read one `\n`-terminated line of at most `max_len` bytes, without the terminator.
///
/// Returns `None` on a clean end of stream before any byte arrived.
pub async fn read_line<R>(r: &mut R, max_len: usize) -> FramecastResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *r)
        .take(max_len as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && n >= max_len {
        return Err(FramecastError::protocol(format!(
            "line longer than {max_len} bytes"
        )));
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_wire_layout() {
        let mut out = Vec::new();
        write_frame(&mut out, &[0xab; 6]).await.unwrap();
        assert_eq!(&out[..4], &[0, 0, 0, 6]);
        assert_eq!(out.len(), 10);

        let mut rd = out.as_slice();
        assert_eq!(read_frame(&mut rd, 6).await.unwrap(), vec![0xab; 6]);
    }

    #[tokio::test]
    async fn wrong_length_is_a_protocol_error() {
        let mut out = Vec::new();
        write_frame(&mut out, &[1, 2, 3, 4]).await.unwrap();
        let mut rd = out.as_slice();
        let err = read_frame(&mut rd, 2048).await.unwrap_err();
        assert!(matches!(err, FramecastError::Protocol(_)));
    }

    #[tokio::test]
    async fn short_payload_is_an_io_error() {
        let bytes = [0u8, 0, 0, 8, 1, 2, 3];
        let mut rd = &bytes[..];
        let err = read_frame(&mut rd, 8).await.unwrap_err();
        assert!(matches!(err, FramecastError::Io(_)));
    }

    #[tokio::test]
    async fn lines_are_bounded() {
        let mut rd: &[u8] = b"STREAM:32:32:-\r\nrest";
        assert_eq!(
            read_line(&mut rd, 64).await.unwrap().as_deref(),
            Some("STREAM:32:32:-")
        );
        assert_eq!(rd, b"rest");

        let mut rd: &[u8] = b"";
        assert_eq!(read_line(&mut rd, 64).await.unwrap(), None);

        let long = vec![b'x'; 100];
        let mut rd = long.as_slice();
        assert!(read_line(&mut rd, 16).await.is_err());
    }
}
