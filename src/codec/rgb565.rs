use crate::foundation::error::{FramecastError, FramecastResult};

/// Pack one 8-bit RGB triple into RGB565.
#[inline]
pub fn pack_pixel(r: u8, g: u8, b: u8) -> u16 {
    (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3)
}

/// Expand one RGB565 value back to 8-bit RGB (low bits zero-filled).
#[inline]
pub fn unpack_pixel(v: u16) -> [u8; 3] {
    [
        (((v >> 11) & 0x1f) << 3) as u8,
        (((v >> 5) & 0x3f) << 2) as u8,
        ((v & 0x1f) << 3) as u8,
    ]
}

/// Pack tightly packed RGB8 pixels (row-major) into big-endian RGB565.
pub fn pack_rgb8(rgb: &[u8]) -> FramecastResult<Vec<u8>> {
    if !rgb.len().is_multiple_of(3) {
        return Err(FramecastError::codec(
            "rgb8 buffer length must be a multiple of 3",
        ));
    }
    let mut out = Vec::with_capacity(rgb.len() / 3 * 2);
    for px in rgb.chunks_exact(3) {
        out.extend_from_slice(&pack_pixel(px[0], px[1], px[2]).to_be_bytes());
    }
    Ok(out)
}

/// Unpack a big-endian RGB565 frame into tightly packed RGB8.
pub fn unpack_to_rgb8(data: &[u8]) -> FramecastResult<Vec<u8>> {
    if !data.len().is_multiple_of(2) {
        return Err(FramecastError::codec("rgb565 frame length must be even"));
    }
    let mut out = Vec::with_capacity(data.len() / 2 * 3);
    for px in data.chunks_exact(2) {
        out.extend_from_slice(&unpack_pixel(u16::from_be_bytes([px[0], px[1]])));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primaries_land_in_their_bit_fields() {
        assert_eq!(pack_pixel(255, 0, 0), 0xf800);
        assert_eq!(pack_pixel(0, 255, 0), 0x07e0);
        assert_eq!(pack_pixel(0, 0, 255), 0x001f);
        assert_eq!(pack_pixel(255, 255, 255), 0xffff);
    }

    #[test]
    fn pack_is_big_endian_row_major() {
        let rgb = [255, 0, 0, 0, 0, 255];
        assert_eq!(pack_rgb8(&rgb).unwrap(), vec![0xf8, 0x00, 0x00, 0x1f]);
        assert!(pack_rgb8(&[1, 2]).is_err());
    }

    #[test]
    fn unpack_truncates_low_bits() {
        assert_eq!(unpack_pixel(pack_pixel(200, 100, 50)), [200, 100, 48]);
        assert_eq!(
            unpack_to_rgb8(&[0xf8, 0x00]).unwrap(),
            vec![248, 0, 0]
        );
        assert!(unpack_to_rgb8(&[0xf8]).is_err());
    }
}
