//! Type descriptor and member name validation, plus shorty matching.

/// Maximum array dimension a descriptor may declare.
const MAX_ARRAY_RANK: usize = 255;

pub fn is_primitive_descriptor_char(c: u8) -> bool {
    matches!(c, b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z')
}

pub fn is_shorty_char(c: u8) -> bool {
    is_primitive_descriptor_char(c) || c == b'V' || c == b'L'
}

/// A full type descriptor: optional array rank, then a primitive char or a
/// `Lfully/qualified/Name;` reference.
pub fn is_valid_type_descriptor(desc: &str) -> bool {
    let bytes = desc.as_bytes();
    let rank = bytes.iter().take_while(|&&c| c == b'[').count();
    if rank > MAX_ARRAY_RANK {
        return false;
    }
    let rest = &bytes[rank..];
    match rest.first() {
        Some(&c) if is_primitive_descriptor_char(c) => rest.len() == 1,
        Some(b'V') => rank == 0 && rest.len() == 1,
        Some(b'L') => is_valid_class_name(rest),
        _ => false,
    }
}

/// A class descriptor: `Lfully/qualified/Name;` with no array rank.
pub fn is_valid_class_descriptor(desc: &str) -> bool {
    desc.as_bytes().first() == Some(&b'L') && is_valid_class_name(desc.as_bytes())
}

fn is_valid_class_name(bytes: &[u8]) -> bool {
    // bytes[0] == b'L' checked by callers
    if bytes.len() < 3 || bytes[bytes.len() - 1] != b';' {
        return false;
    }
    let body = &bytes[1..bytes.len() - 1];
    let mut component_len = 0;
    for &c in body {
        if c == b'/' {
            if component_len == 0 {
                return false; // empty package component
            }
            component_len = 0;
        } else {
            if !is_valid_member_name_char(c) {
                return false;
            }
            component_len += 1;
        }
    }
    component_len != 0
}

fn is_valid_member_name_char(c: u8) -> bool {
    // SimpleName characters; non-ASCII bytes are part of mUTF-8 sequences
    // already validated at the string level.
    c.is_ascii_alphanumeric() || matches!(c, b'$' | b'-' | b'_') || c >= 0x80
}

/// A field or method name. `<init>`/`<clinit>` are the only names allowed
/// to carry angle brackets.
pub fn is_valid_member_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    if name == "<init>" || name == "<clinit>" {
        return true;
    }
    name.bytes().all(is_valid_member_name_char)
}

/// The shorty character a full descriptor collapses to.
pub fn shorty_char_for(desc: &str) -> u8 {
    match desc.as_bytes().first() {
        Some(&c) if is_primitive_descriptor_char(c) || c == b'V' => c,
        _ => b'L', // references and arrays
    }
}

/// Whether `shorty_char` correctly summarizes `descriptor`.
pub fn shorty_matches(shorty_char: u8, descriptor: &str) -> bool {
    shorty_char_for(descriptor) == shorty_char
}

/// Human-readable rendering of a descriptor, e.g. `[I` -> `int[]`.
pub fn pretty_desc(desc: &str) -> String {
    let dim = desc.chars().filter(|c| *c == '[').count();
    let name = &desc[dim..];
    let mut output = String::new();

    if name.starts_with('L') {
        let end_idx = if name.ends_with(';') {
            name.len() - 1
        } else {
            name.len()
        };
        output.push_str(&name[1..end_idx].replace('/', "."));
    } else {
        output.push_str(match name.as_bytes().first() {
            Some(b'B') => "byte",
            Some(b'C') => "char",
            Some(b'D') => "double",
            Some(b'F') => "float",
            Some(b'I') => "int",
            Some(b'J') => "long",
            Some(b'S') => "short",
            Some(b'Z') => "boolean",
            Some(b'V') => "void",
            _ => name,
        });
    }

    if dim > 0 {
        output.push_str(&"[]".repeat(dim));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_type_descriptors() {
        for desc in ["I", "J", "Z", "[I", "[[J", "Ljava/lang/Object;", "[Ljava/lang/String;"] {
            assert!(is_valid_type_descriptor(desc), "{desc}");
        }
    }

    #[test]
    fn test_invalid_type_descriptors() {
        for desc in ["", "X", "L;", "Ljava/lang/Object", "[[", "[V", "II", "Ljava//Object;"] {
            assert!(!is_valid_type_descriptor(desc), "{desc}");
        }
    }

    #[test]
    fn test_void_only_bare() {
        assert!(is_valid_type_descriptor("V"));
        assert!(!is_valid_type_descriptor("[V"));
    }

    #[test]
    fn test_class_descriptor() {
        assert!(is_valid_class_descriptor("La/b/C;"));
        assert!(!is_valid_class_descriptor("I"));
        assert!(!is_valid_class_descriptor("[La/b/C;"));
    }

    #[test]
    fn test_member_names() {
        assert!(is_valid_member_name("value"));
        assert!(is_valid_member_name("<init>"));
        assert!(is_valid_member_name("<clinit>"));
        assert!(!is_valid_member_name("<foo>"));
        assert!(!is_valid_member_name(""));
    }

    #[test]
    fn test_shorty_chars() {
        assert_eq!(shorty_char_for("I"), b'I');
        assert_eq!(shorty_char_for("Ljava/lang/Object;"), b'L');
        assert_eq!(shorty_char_for("[I"), b'L');
        assert!(shorty_matches(b'L', "[[Ljava/lang/String;"));
        assert!(!shorty_matches(b'I', "J"));
    }

    #[test]
    fn test_pretty_desc() {
        assert_eq!(pretty_desc("[I"), "int[]");
        assert_eq!(pretty_desc("Ljava/lang/Object;"), "java.lang.Object");
    }
}
