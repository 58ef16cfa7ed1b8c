use crate::{dex_err, Result};

/// Decodes an unsigned LEB128 value. Returns the value and the number of
/// bytes consumed. Encodings longer than five bytes for a u32 (or that run
/// past the end of `data_in`) are rejected.
#[inline(always)]
pub fn decode_leb128<T: varint_simd::VarIntTarget>(data_in: &[u8]) -> Result<(T, usize)> {
    Ok(varint_simd::decode::<T>(data_in)?)
}

#[inline(always)]
pub fn decode_leb128_off<T: varint_simd::VarIntTarget>(
    data_in: &[u8],
    ptr_pos: &mut usize,
) -> Result<T> {
    let (value, size) = decode_leb128(data_in)?;
    *ptr_pos += size;
    Ok(value)
}

/// Decodes an unsigned LEB128 value starting at `*pos` inside `data`, moving
/// `*pos` past it.
#[inline(always)]
pub fn decode_leb128_at<T: varint_simd::VarIntTarget>(data: &[u8], pos: &mut usize) -> Result<T> {
    if *pos > data.len() {
        return dex_err!(TruncatedLeb128 {
            offset: *pos,
            item_ty: "uleb128"
        });
    }
    let (value, size) = decode_leb128(&data[*pos..])?;
    *pos += size;
    Ok(value)
}

/// Decodes a ULEB128p1: an unsigned LEB128 biased by one, used where
/// "no index" (encoded as 0) must be representable next to index 0.
#[inline(always)]
pub fn decode_leb128p1_at(data: &[u8], pos: &mut usize) -> Result<i32> {
    let value: u32 = decode_leb128_at(data, pos)?;
    Ok(value.wrapping_sub(1) as i32)
}

/// Decodes a signed LEB128 value starting at `*pos`. At most five bytes are
/// consumed for an i32; longer encodings are rejected.
pub fn decode_sleb128(data: &[u8], pos: &mut usize) -> Result<i32> {
    let mut result: i32 = 0;
    let mut shift: u32 = 0;
    loop {
        let Some(&byte) = data.get(*pos) else {
            return dex_err!(TruncatedLeb128 {
                offset: *pos,
                item_ty: "sleb128"
            });
        };
        *pos += 1;
        result |= (((byte & 0x7f) as i32) << shift) as i32;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 32 {
                // sign-extend from the last significant bit
                let unused = 32 - shift;
                result = (result << unused) >> unused;
            }
            return Ok(result);
        }
        if shift >= 35 {
            return dex_err!(TruncatedLeb128 {
                offset: *pos,
                item_ty: "sleb128 (too long)"
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_leb128_single_byte() {
        let (value, size) = decode_leb128::<u32>(&[0x3f]).unwrap();
        assert_eq!(value, 0x3f);
        assert_eq!(size, 1);
    }

    #[test]
    fn test_decode_leb128_multi_byte() {
        // 0x80 0x7f => 0x3f80
        let (value, size) = decode_leb128::<u32>(&[0x80, 0x7f]).unwrap();
        assert_eq!(value, 0x3f80);
        assert_eq!(size, 2);
    }

    #[test]
    fn test_decode_leb128_truncated() {
        assert!(decode_leb128::<u32>(&[0x80]).is_err());
    }

    #[test]
    fn test_decode_leb128_too_long() {
        // six continuation bytes cannot encode a u32
        assert!(decode_leb128::<u32>(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x7f]).is_err());
    }

    #[test]
    fn test_decode_sleb128_negative() {
        let mut pos = 0;
        // -1 encodes as 0x7f
        assert_eq!(decode_sleb128(&[0x7f], &mut pos).unwrap(), -1);
        assert_eq!(pos, 1);
    }

    #[test]
    fn test_decode_sleb128_positive() {
        let mut pos = 0;
        assert_eq!(decode_sleb128(&[0x3c], &mut pos).unwrap(), 0x3c);
    }

    #[test]
    fn test_decode_sleb128_two_bytes() {
        let mut pos = 0;
        // -128 encodes as 0x80 0x7f
        assert_eq!(decode_sleb128(&[0x80, 0x7f], &mut pos).unwrap(), -128);
        assert_eq!(pos, 2);
    }

    #[test]
    fn test_decode_sleb128_truncated() {
        let mut pos = 0;
        assert!(decode_sleb128(&[0x80], &mut pos).is_err());
    }

    #[test]
    fn test_decode_leb128p1() {
        let mut pos = 0;
        assert_eq!(decode_leb128p1_at(&[0x00], &mut pos).unwrap(), -1);
        let mut pos = 0;
        assert_eq!(decode_leb128p1_at(&[0x01], &mut pos).unwrap(), 0);
    }
}
