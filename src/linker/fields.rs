//! Field layout: packing instance and static fields by size category and
//! recording reference offsets for the garbage collector.

use super::class::Field;

/// Object header: class pointer plus monitor word.
pub const OBJECT_HEADER_SIZE: u32 = 8;

/// Sentinel for `reference_offsets` when the bitmap cannot describe every
/// reference field; the GC must walk the superclass chain and consult field
/// metadata instead.
pub const CLASS_WALK_SUPER: u32 = 0xc000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    /// total storage in bytes (object size for instance layouts)
    pub size: u32,
    /// bit `i` set means the 4-byte word at offset `4 * i` holds a
    /// reference, or [`CLASS_WALK_SUPER`]
    pub reference_offsets: u32,
}

impl FieldLayout {
    pub const fn empty(base: u32) -> Self {
        Self {
            size: base,
            reference_offsets: 0,
        }
    }

    pub fn is_walk_super(&self) -> bool {
        self.reference_offsets == CLASS_WALK_SUPER
    }
}

/// Takes a free gap if one fits, otherwise aligns the bump pointer and
/// remembers the padding as a new gap.
fn place(gaps: &mut Vec<(u32, u32)>, current: &mut u32, size: u32) -> u32 {
    if let Some(i) = gaps
        .iter()
        .position(|(off, len)| *len >= size && *off % size == 0)
    {
        let (off, len) = gaps.remove(i);
        if len > size {
            gaps.push((off + size, len - size));
        }
        return off;
    }
    let aligned = (*current + size - 1) & !(size - 1);
    if aligned > *current {
        gaps.push((*current, aligned - *current));
    }
    *current = aligned + size;
    aligned
}

/// Assigns offsets to `fields` starting at `base`, packing by category:
/// references first (so the GC bitmap covers a contiguous prefix), then
/// 64-bit, 32-bit, 16-bit and 8-bit values, with alignment gaps backfilled
/// by the smaller categories.
///
/// `inherited` is the superclass's layout for instance fields (statics pass
/// an empty layout with base 0).
pub fn link_fields(fields: &mut [Field], base: u32, inherited: FieldLayout) -> FieldLayout {
    let mut order: Vec<usize> = (0..fields.len()).collect();
    // stable partition: references, then descending size
    order.sort_by_key(|&i| {
        let f = &fields[i];
        if f.is_reference() {
            0u32
        } else {
            9 - f.size()
        }
    });

    let mut current = base;
    let mut gaps: Vec<(u32, u32)> = Vec::new();
    let mut reference_offsets: u32 = if inherited.is_walk_super() {
        CLASS_WALK_SUPER
    } else {
        inherited.reference_offsets
    };

    for &i in &order {
        let size = fields[i].size();
        let offset = place(&mut gaps, &mut current, size);
        fields[i].offset = offset;
        if fields[i].is_reference() && reference_offsets != CLASS_WALK_SUPER {
            let slot = offset / 4;
            if slot >= 31 {
                reference_offsets = CLASS_WALK_SUPER;
            } else {
                reference_offsets |= 1 << slot;
            }
        }
    }

    FieldLayout {
        size: (current + 3) & !3,
        reference_offsets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, descriptor: &str) -> Field {
        Field {
            name: name.into(),
            descriptor: descriptor.into(),
            access_flags: 0,
            offset: 0,
        }
    }

    #[test]
    fn test_references_come_first() {
        let mut fields = vec![
            field("a", "J"),
            field("b", "Ljava/lang/Object;"),
            field("c", "I"),
            field("d", "[B"),
        ];
        let layout = link_fields(&mut fields, OBJECT_HEADER_SIZE, FieldLayout::empty(0));

        let b = fields.iter().find(|f| &*f.name == "b").unwrap();
        let d = fields.iter().find(|f| &*f.name == "d").unwrap();
        assert_eq!(b.offset, 8);
        assert_eq!(d.offset, 12);
        // bits for words 2 and 3 (offsets 8 and 12)
        assert_eq!(layout.reference_offsets, (1 << 2) | (1 << 3));
    }

    #[test]
    fn test_alignment_gap_is_backfilled() {
        let mut fields = vec![
            field("wide", "J"),
            field("narrow", "S"),
            field("tiny", "Z"),
            field("word", "I"),
        ];
        let layout = link_fields(&mut fields, 4, FieldLayout::empty(0));

        let wide = fields.iter().find(|f| &*f.name == "wide").unwrap();
        assert_eq!(wide.offset % 8, 0);
        // the 4 bytes of padding before the long are reused
        let reused: Vec<u32> = fields
            .iter()
            .filter(|f| &*f.name != "wide")
            .map(|f| f.offset)
            .collect();
        assert!(reused.iter().any(|&off| off < wide.offset), "{reused:?}");
        assert_eq!(layout.reference_offsets, 0);
        assert_eq!(layout.size % 4, 0);
    }

    #[test]
    fn test_no_overlaps() {
        let mut fields = vec![
            field("a", "J"),
            field("b", "I"),
            field("c", "S"),
            field("d", "Z"),
            field("e", "Z"),
            field("f", "Ljava/lang/Object;"),
            field("g", "D"),
        ];
        let layout = link_fields(&mut fields, OBJECT_HEADER_SIZE, FieldLayout::empty(0));
        let mut spans: Vec<(u32, u32)> = fields.iter().map(|f| (f.offset, f.size())).collect();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{spans:?}");
        }
        assert!(layout.size >= spans.last().unwrap().0 + spans.last().unwrap().1);
    }

    #[test]
    fn test_many_references_fall_back_to_walk_super() {
        let mut fields: Vec<Field> = (0..40)
            .map(|i| field(&format!("r{i}"), "Ljava/lang/Object;"))
            .collect();
        let layout = link_fields(&mut fields, OBJECT_HEADER_SIZE, FieldLayout::empty(0));
        assert_eq!(layout.reference_offsets, CLASS_WALK_SUPER);
    }

    #[test]
    fn test_inherited_bitmap_is_preserved() {
        let inherited = FieldLayout {
            size: 12,
            reference_offsets: 1 << 2,
        };
        let mut fields = vec![field("x", "Ljava/lang/Object;")];
        let layout = link_fields(&mut fields, inherited.size, inherited);
        assert_eq!(layout.reference_offsets, (1 << 2) | (1 << 3));
    }
}
