//! Modified UTF-8 ("mUTF-8") handling. Dex files store strings as a ULEB128
//! UTF-16 length followed by mUTF-8 bytes and a trailing NUL: U+0000 is
//! encoded as 0xC0 0x80 and supplementary code points as surrogate pairs of
//! three-byte sequences (plain four-byte sequences also decode).

use crate::{dex_err, Result};

pub fn mutf8_to_str(utf8_data_in: &[u8]) -> Result<String> {
    let utf16_data = mutf8_to_utf16(utf8_data_in);
    Ok(String::from_utf16(&utf16_data)?)
}

pub fn mutf8_to_str_lossy(utf8_data_in: &[u8]) -> String {
    let utf16_data = mutf8_to_utf16(utf8_data_in);
    String::from_utf16_lossy(&utf16_data)
}

pub fn str_to_mutf8(str_data_in: &str) -> Vec<u8> {
    let utf16_data_in: Vec<u16> = str_data_in.encode_utf16().collect();
    utf16_to_mutf8(&utf16_data_in)
}

/// Decodes one code unit (or surrogate pair, packed low/high) starting at
/// `*offset`. Input must already be validated; out-of-range reads yield a
/// replacement character instead of a panic.
#[inline]
fn utf16_from_utf8(utf8_data_in: &[u8], offset: &mut usize) -> u32 {
    let byte_at = |idx: usize| -> u8 { utf8_data_in.get(idx).copied().unwrap_or(0) };

    let one = byte_at(*offset);
    *offset += 1;
    if one & 0x80 == 0 {
        return one as u32;
    }

    let two = byte_at(*offset);
    *offset += 1;
    if one & 0x20 == 0 {
        return ((one & 0x1f) as u32) << 6 | (two & 0x3f) as u32;
    }

    let three = byte_at(*offset);
    *offset += 1;
    if one & 0x10 == 0 {
        return ((one & 0x0f) as u32) << 12 | ((two & 0x3f) as u32) << 6 | (three & 0x3f) as u32;
    }

    let four = byte_at(*offset);
    *offset += 1;
    let code_point = ((one & 0x0f) as u32) << 18
        | ((two & 0x3f) as u32) << 12
        | ((three & 0x3f) as u32) << 6
        | (four & 0x3f) as u32;

    // surrogate pair packed as (trailing << 16) | leading
    let mut surrogate_pair: u32 = 0x00;
    surrogate_pair |= ((code_point >> 10) + 0xd7c0) & 0xffff;
    surrogate_pair |= ((code_point & 0x03ff) + 0xdc00) << 16;
    surrogate_pair
}

#[inline(always)]
fn trailing_utf16_char(maybe_pair: u32) -> u16 {
    (maybe_pair >> 16) as u16
}

#[inline(always)]
fn leading_utf16_char(maybe_pair: u32) -> u16 {
    (maybe_pair & 0xffff) as u16
}

#[inline(always)]
fn is_lead(ch: u16) -> bool {
    ch & 0xfc00 == 0xd800
}

#[inline(always)]
fn is_trail(ch: u16) -> bool {
    ch & 0xfc00 == 0xdc00
}

#[inline(always)]
fn is_surrogate(ch: u16) -> bool {
    ch & 0xf800 == 0xd800
}

#[inline(always)]
fn get_supplementary(lead: u16, trail: u16) -> u32 {
    const OFFSET: u32 = (0xd800 << 10) + 0xdc00 - 0x10000;
    ((lead as u32) << 10) + (trail as u32) - OFFSET
}

/// Number of UTF-16 code units `utf8_in_len` bytes of mUTF-8 decode to.
pub fn mutf8_len(utf8_data_in: &[u8], utf8_in_len: usize) -> usize {
    let mut len = 0;
    let mut in_idx = 0;
    while in_idx < utf8_in_len {
        let ic = utf8_data_in[in_idx];
        in_idx += 1;
        len += 1;
        if ic & 0x80 == 0 {
            continue; // one byte encoding
        }

        in_idx += 1;
        if ic & 0x20 == 0 {
            continue; // two byte encoding
        }

        in_idx += 1;
        if ic & 0x10 == 0 {
            continue; // three byte encoding
        }

        // Four-byte encoding: becomes a surrogate pair.
        in_idx += 1;
        len += 1;
    }
    len
}

/// Decodes mUTF-8 (with trailing NUL) to UTF-16 code units.
pub fn mutf8_to_utf16(utf8_data_in: &[u8]) -> Vec<u16> {
    if utf8_data_in.is_empty() {
        return Vec::new();
    }

    let utf8_in_len = utf8_data_in.len() - 1;
    let out_chars = mutf8_len(utf8_data_in, utf8_in_len);

    if utf8_in_len == out_chars {
        // common case where all chars are ASCII
        return utf8_data_in[..utf8_in_len].iter().map(|i| *i as u16).collect();
    }

    let mut utf16_data_out: Vec<u16> = Vec::with_capacity(out_chars);
    let mut in_idx = 0;
    while in_idx < utf8_in_len {
        let ch = utf16_from_utf8(utf8_data_in, &mut in_idx);
        utf16_data_out.push(leading_utf16_char(ch));
        let trailing = trailing_utf16_char(ch);
        if trailing != 0 {
            utf16_data_out.push(trailing);
        }
    }
    utf16_data_out
}

fn utf16_to_mutf8(utf16_in: &[u16]) -> Vec<u8> {
    let mut mutf8_out: Vec<u8> = Vec::with_capacity(utf16_in.len() + 1);
    let mut in_idx = 0;
    while in_idx < utf16_in.len() {
        let ch = utf16_in[in_idx];
        if ch != 0 && ch < 0x80 {
            mutf8_out.push(ch as u8);
        } else if ch < 0x800 {
            // includes the 0xC0 0x80 encoding of U+0000
            mutf8_out.push(((ch >> 6) | 0xc0) as u8);
            mutf8_out.push(((ch & 0x3f) | 0x80) as u8);
        } else if is_lead(ch) && in_idx + 1 != utf16_in.len() && is_trail(utf16_in[in_idx + 1]) {
            let code_point = get_supplementary(ch, utf16_in[in_idx + 1]);
            in_idx += 1;
            mutf8_out.push(((code_point >> 18) | 0xf0) as u8);
            mutf8_out.push((((code_point >> 12) & 0x3f) | 0x80) as u8);
            mutf8_out.push((((code_point >> 6) & 0x3f) | 0x80) as u8);
            mutf8_out.push(((code_point & 0x3f) | 0x80) as u8);
        } else {
            // unpaired surrogates pass through as three-byte sequences
            mutf8_out.push(((ch >> 12) | 0xe0) as u8);
            mutf8_out.push((((ch >> 6) & 0x3f) | 0x80) as u8);
            mutf8_out.push(((ch & 0x3f) | 0x80) as u8);
        }
        in_idx += 1;
    }
    mutf8_out.push(0x00);
    mutf8_out
}

/// Strict validation used by the verifier: every byte of `data` (not
/// including a trailing NUL, which the caller checks) must form valid
/// mUTF-8, and the decoded UTF-16 length must equal `declared`.
///
/// `base_offset` is only used for error reporting.
pub fn check_mutf8(data: &[u8], declared: u32, base_offset: usize) -> Result<()> {
    let mut units: u32 = 0;
    let mut idx = 0;
    while idx < data.len() {
        let start = idx;
        let one = data[idx];
        idx += 1;

        let extra_bytes;
        let min_code_point;
        if one & 0x80 == 0 {
            if one == 0 {
                // interior NUL must use the two-byte form
                return dex_err!(BadMutf8Byte {
                    byte: one,
                    offset: base_offset + start
                });
            }
            units += 1;
            continue;
        } else if one & 0xe0 == 0xc0 {
            extra_bytes = 1;
            min_code_point = 0x80;
        } else if one & 0xf0 == 0xe0 {
            extra_bytes = 2;
            min_code_point = 0x800;
        } else if one & 0xf8 == 0xf0 {
            extra_bytes = 3;
            min_code_point = 0x10000;
        } else {
            return dex_err!(BadMutf8Byte {
                byte: one,
                offset: base_offset + start
            });
        }

        let mut code_point: u32 = (one & (0x7f >> (extra_bytes + 1))) as u32;
        for _ in 0..extra_bytes {
            let Some(&cont) = data.get(idx) else {
                return dex_err!(BadMutf8Byte {
                    byte: one,
                    offset: base_offset + start
                });
            };
            if cont & 0xc0 != 0x80 {
                return dex_err!(BadMutf8Byte {
                    byte: cont,
                    offset: base_offset + idx
                });
            }
            code_point = (code_point << 6) | (cont & 0x3f) as u32;
            idx += 1;
        }

        // The two-byte form of U+0000 is the one allowed overlong encoding.
        let zero_shortcut = extra_bytes == 1 && code_point == 0;
        if !zero_shortcut && code_point < min_code_point {
            return dex_err!(BadMutf8Byte {
                byte: one,
                offset: base_offset + start
            });
        }
        if code_point > 0x10ffff {
            return dex_err!(BadMutf8Byte {
                byte: one,
                offset: base_offset + start
            });
        }
        units += if code_point >= 0x10000 { 2 } else { 1 };
    }

    if units != declared {
        return dex_err!(Mutf8LengthMismatch {
            offset: base_offset,
            declared,
            actual: units
        });
    }
    Ok(())
}

/// Compares two NUL-terminated mUTF-8 strings as sequences of UTF-16 code
/// point values. This is the order string ids must be sorted in.
pub fn compare_mutf8_as_utf16(lhs: &[u8], rhs: &[u8]) -> std::cmp::Ordering {
    let a = mutf8_to_utf16(lhs);
    let b = mutf8_to_utf16(rhs);
    a.cmp(&b)
}

/// The hash used for descriptor lookups: `h = h * 31 + byte` over the
/// mUTF-8 bytes up to (not including) the NUL terminator.
pub fn mutf8_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &b in bytes {
        if b == 0 {
            break;
        }
        hash = hash.wrapping_mul(31).wrapping_add(b as u32);
    }
    hash
}

/// Same hash over a Rust string (descriptors are always ASCII in practice,
/// where UTF-8 and mUTF-8 coincide).
pub fn str_hash(s: &str) -> u32 {
    mutf8_hash(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_to_mutf8() {
        let data = "foobar";
        assert_eq!(str_to_mutf8(data), b"foobar\0");
    }

    #[test]
    fn test_mutf8_to_str() {
        let data = &[102, 111, 111, 98, 97, 114, 0];
        assert_eq!(mutf8_to_str_lossy(data), "foobar".to_string());
    }

    #[test]
    fn test_nul_roundtrip() {
        let encoded = str_to_mutf8("a\u{0}b");
        assert_eq!(encoded, &[b'a', 0xc0, 0x80, b'b', 0x00]);
        assert_eq!(mutf8_to_str(&encoded).unwrap(), "a\u{0}b");
    }

    #[test]
    fn test_supplementary_roundtrip() {
        let encoded = str_to_mutf8("\u{1F600}");
        assert_eq!(mutf8_to_str(&encoded).unwrap(), "\u{1F600}");
    }

    #[test]
    fn test_check_mutf8_accepts_ascii() {
        assert!(check_mutf8(b"Ljava/lang/Object;", 18, 0).is_ok());
    }

    #[test]
    fn test_check_mutf8_rejects_interior_nul() {
        assert!(check_mutf8(&[b'a', 0x00, b'b'], 3, 0).is_err());
    }

    #[test]
    fn test_check_mutf8_rejects_bad_continuation() {
        assert!(check_mutf8(&[0xc2, 0x20], 1, 0).is_err());
    }

    #[test]
    fn test_check_mutf8_rejects_overlong() {
        // U+0041 in two bytes
        assert!(check_mutf8(&[0xc1, 0x81], 1, 0).is_err());
    }

    #[test]
    fn test_check_mutf8_length_mismatch() {
        assert!(check_mutf8(b"ab", 3, 0).is_err());
    }

    #[test]
    fn test_check_mutf8_counts_surrogate_pair() {
        let encoded = str_to_mutf8("\u{1F600}");
        let body = &encoded[..encoded.len() - 1];
        assert!(check_mutf8(body, 2, 0).is_ok());
        assert!(check_mutf8(body, 1, 0).is_err());
    }

    #[test]
    fn test_compare_orders_by_utf16() {
        let a = str_to_mutf8("A");
        let b = str_to_mutf8("B");
        assert_eq!(
            compare_mutf8_as_utf16(&a, &b),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn test_hash_stops_at_nul() {
        assert_eq!(mutf8_hash(b"abc\0def"), mutf8_hash(b"abc\0"));
        assert_eq!(str_hash("abc"), mutf8_hash(b"abc"));
    }
}
