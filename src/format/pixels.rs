//! Sample buffer reshaping shared by the backends.
//!
//! Chunk buffers leave a backend in canonical `[c][y][x]` order with
//! native-endian samples. These helpers get them there from whatever the
//! container stores.

/// Byte-swap every sample in place if the stored order differs from ours.
pub fn to_native_endian(buf: &mut [u8], bytes_per_sample: usize, stored_little_endian: bool) {
    if bytes_per_sample <= 1 || stored_little_endian == cfg!(target_endian = "little") {
        return;
    }
    for sample in buf.chunks_exact_mut(bytes_per_sample) {
        sample.reverse();
    }
}

/// Turn `[pixel][sample]` into `[sample][pixel]`, keeping only the samples
/// in `first..first + count`.
pub fn deinterleave(
    src: &[u8],
    pixels: usize,
    samples: usize,
    bytes_per_sample: usize,
    first: usize,
    count: usize,
) -> Vec<u8> {
    if samples == 1 && first == 0 && count == 1 {
        return src[..pixels * bytes_per_sample].to_vec();
    }

    let pixel_stride = samples * bytes_per_sample;
    let mut out = vec![0u8; pixels * count * bytes_per_sample];
    for (k, s) in (first..first + count).enumerate() {
        let plane = &mut out[k * pixels * bytes_per_sample..(k + 1) * pixels * bytes_per_sample];
        for p in 0..pixels {
            let from = p * pixel_stride + s * bytes_per_sample;
            plane[p * bytes_per_sample..(p + 1) * bytes_per_sample]
                .copy_from_slice(&src[from..from + bytes_per_sample]);
        }
    }
    out
}

/// Copy a `height x width` window starting at the origin out of rows that
/// are `src_row_bytes` long.
pub fn crop_rows(src: &[u8], src_row_bytes: usize, row_bytes: usize, height: usize) -> Vec<u8> {
    if src_row_bytes == row_bytes {
        return src[..row_bytes * height].to_vec();
    }
    let mut out = Vec::with_capacity(row_bytes * height);
    for row in src.chunks(src_row_bytes).take(height) {
        out.extend_from_slice(&row[..row_bytes]);
    }
    out
}

/// Copy an arbitrary window out of a plane.
pub fn crop_window(
    src: &[u8],
    src_width: usize,
    bytes_per_pixel: usize,
    y: usize,
    x: usize,
    height: usize,
    width: usize,
) -> Vec<u8> {
    let src_row = src_width * bytes_per_pixel;
    let mut out = Vec::with_capacity(height * width * bytes_per_pixel);
    for row in y..y + height {
        let start = row * src_row + x * bytes_per_pixel;
        out.extend_from_slice(&src[start..start + width * bytes_per_pixel]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deinterleave_rgb_subset() {
        let src = [1, 2, 3, 4, 5, 6];
        assert_eq!(deinterleave(&src, 2, 3, 1, 0, 3), vec![1, 4, 2, 5, 3, 6]);
        assert_eq!(deinterleave(&src, 2, 3, 1, 2, 1), vec![3, 6]);
    }

    #[test]
    fn test_swap_when_stored_order_differs() {
        let mut buf = 0x0102u16.to_be_bytes().to_vec();
        to_native_endian(&mut buf, 2, false);
        assert_eq!(u16::from_ne_bytes([buf[0], buf[1]]), 0x0102);
    }

    #[test]
    fn test_crop() {
        let src: Vec<u8> = (0..16).collect();
        assert_eq!(crop_rows(&src, 4, 2, 2), vec![0, 1, 4, 5]);
        assert_eq!(crop_window(&src, 4, 1, 1, 1, 2, 2), vec![5, 6, 9, 10]);
    }
}
