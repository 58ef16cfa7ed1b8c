//! Descriptor-to-class-def lookup table.
//!
//! The table is a power-of-two hash table written at compile time and mapped
//! read-only at load time. Binary format: a `u32` mask (table size minus
//! one) followed by `mask + 1` entries of `{u32 str_offset, u16 data,
//! u16 next_pos_delta}`. `data` packs the class-def index in the low (mask)
//! bits and spare hash bits above them; `next_pos_delta` links open
//! addressing chains, `0` terminating a chain. An empty `str_offset` marks a
//! vacant slot.

use plain::Plain;

use crate::{dex_err, error::DexError, leb128, utf, Result};

use super::{DexContainer, DexFile};

#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Entry {
    pub str_offset: u32,
    pub data: u16,
    pub next_pos_delta: u16,
}

unsafe impl plain::Plain for Entry {}

impl Entry {
    #[inline]
    fn is_empty(&self) -> bool {
        self.str_offset == 0
    }

    #[inline]
    fn is_last(&self) -> bool {
        self.next_pos_delta == 0
    }
}

enum Storage<'a> {
    Owned(Vec<Entry>),
    Mapped(&'a [Entry]),
}

impl Storage<'_> {
    fn entries(&self) -> &[Entry] {
        match self {
            Storage::Owned(v) => v,
            Storage::Mapped(s) => s,
        }
    }
}

pub struct TypeLookupTable<'a, C: DexContainer<'a>> {
    dex: &'a DexFile<'a, C>,
    mask: u32,
    storage: Storage<'a>,
}

impl<'a, C: DexContainer<'a>> TypeLookupTable<'a, C> {
    /// Number of buckets.
    pub fn size(&self) -> u32 {
        self.mask + 1
    }

    /// Builds the table for a verified dex file. Fails for files with no
    /// class defs or more than `u16::MAX + 1` of them.
    pub fn create(dex: &'a DexFile<'a, C>) -> Result<Self> {
        let num_class_defs = dex.num_class_defs();
        if !Self::supported_size(num_class_defs) {
            return dex_err!(UnsupportedLookupTableSize, num_class_defs);
        }

        let mask = Self::calculate_mask(num_class_defs);
        let mut entries = vec![Entry::default(); (mask + 1) as usize];

        // Two passes: entries that hash to a free bucket land directly;
        // everything else is linearly probed and chained afterwards, so a
        // bucket's first entry is always a chain head.
        let mut conflicts = Vec::new();
        for (class_def_idx, class_def) in dex.get_class_defs().iter().enumerate() {
            let type_id = dex.get_type_id(class_def.class_idx)?;
            let string_id = dex.get_string_id(type_id.descriptor_idx)?;
            let (_, descriptor) = dex.get_string_data(string_id)?;
            let hash = utf::mutf8_hash(descriptor);
            let entry = Entry {
                str_offset: string_id.string_data_off,
                data: Self::make_data(class_def_idx as u32, hash, mask),
                next_pos_delta: 0,
            };
            let pos = (hash & mask) as usize;
            if entries[pos].is_empty() {
                entries[pos] = entry;
            } else {
                conflicts.push((entry, hash));
            }
        }
        for (entry, hash) in conflicts {
            Self::insert_probed(&mut entries, entry, hash, mask);
        }

        Ok(Self {
            dex,
            mask,
            storage: Storage::Owned(entries),
        })
    }

    /// Opens a table over raw bytes produced by [`TypeLookupTable::raw_data`]
    /// (typically mapped from an oat file).
    pub fn open(raw_data: &'a [u8], dex: &'a DexFile<'a, C>) -> Result<Self> {
        if raw_data.len() < 4 {
            return dex_err!(TruncatedFile);
        }
        let mask = u32::from_le_bytes([raw_data[0], raw_data[1], raw_data[2], raw_data[3]]);
        if mask == u32::MAX || !(mask + 1).is_power_of_two() {
            return dex_err!(DexFileError, "invalid lookup table mask {:#x}", mask);
        }
        let count = (mask + 1) as usize;
        let body = &raw_data[4..];
        if body.len() < count * std::mem::size_of::<Entry>() {
            return Err(DexError::TruncatedFile);
        }
        let storage = match Entry::slice_from_bytes_len(body, count) {
            Ok(entries) => Storage::Mapped(entries),
            // unaligned source: decode a private copy instead
            Err(_) => {
                let mut entries = Vec::with_capacity(count);
                for chunk in body.chunks_exact(8).take(count) {
                    entries.push(Entry {
                        str_offset: u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                        data: u16::from_le_bytes([chunk[4], chunk[5]]),
                        next_pos_delta: u16::from_le_bytes([chunk[6], chunk[7]]),
                    });
                }
                Storage::Owned(entries)
            }
        };
        Ok(Self { dex, mask, storage })
    }

    /// Looks up the class-def index for `descriptor`, whose hash must be
    /// [`crate::utf::str_hash`] of the descriptor. Returns `None` when the
    /// descriptor is not defined by this dex file.
    pub fn lookup(&self, descriptor: &str, hash: u32) -> Option<u32> {
        let entries = self.storage.entries();
        let mut pos = (hash & self.mask) as usize;
        // The insertion algorithm guarantees the element at the initial
        // position is either vacant or the head of its bucket's chain.
        let mut entry = &entries[pos];
        while !entry.is_empty() {
            if self.cmp_hash_bits(entry.data, hash) && self.strings_equal(descriptor, entry.str_offset)
            {
                return Some(self.class_def_idx(entry.data));
            }
            if entry.is_last() {
                return None;
            }
            pos = (pos + entry.next_pos_delta as usize) & self.mask as usize;
            entry = &entries[pos];
        }
        None
    }

    /// Serialized table, as written into an oat file.
    pub fn raw_data(&self) -> Vec<u8> {
        let entries = self.storage.entries();
        let mut out = Vec::with_capacity(self.raw_data_length() as usize);
        out.extend_from_slice(&self.mask.to_le_bytes());
        for entry in entries {
            out.extend_from_slice(&entry.str_offset.to_le_bytes());
            out.extend_from_slice(&entry.data.to_le_bytes());
            out.extend_from_slice(&entry.next_pos_delta.to_le_bytes());
        }
        out
    }

    pub fn raw_data_length(&self) -> u32 {
        4 + self.size() * std::mem::size_of::<Entry>() as u32
    }

    fn supported_size(num_class_defs: u32) -> bool {
        num_class_defs != 0 && num_class_defs <= u16::MAX as u32 + 1
    }

    fn calculate_mask(num_class_defs: u32) -> u32 {
        num_class_defs.next_power_of_two() - 1
    }

    /// Packs the class-def index into the mask bits and spare hash bits into
    /// the rest, so most mismatches are rejected without touching string
    /// data.
    fn make_data(class_def_idx: u32, hash: u32, mask: u32) -> u16 {
        ((class_def_idx & mask) | (hash & !mask & 0xffff)) as u16
    }

    fn class_def_idx(&self, data: u16) -> u32 {
        data as u32 & self.mask
    }

    fn cmp_hash_bits(&self, data: u16, hash: u32) -> bool {
        let mask = !self.mask as u16;
        (hash as u16 & mask) == (data & mask)
    }

    fn strings_equal(&self, descriptor: &str, str_offset: u32) -> bool {
        let data = self.dex.data();
        let mut pos = str_offset as usize;
        // skip the UTF-16 length prefix
        if leb128::decode_leb128_at::<u32>(data, &mut pos).is_err() {
            return false;
        }
        let bytes = descriptor.as_bytes();
        let stored = &data[pos..];
        stored.len() > bytes.len()
            && &stored[..bytes.len()] == bytes
            && stored[bytes.len()] == 0
    }

    fn insert_probed(entries: &mut [Entry], entry: Entry, hash: u32, mask: u32) {
        let tail = Self::find_last_entry_in_bucket(entries, (hash & mask) as usize, mask);
        let mut pos = (tail + 1) & mask as usize;
        while !entries[pos].is_empty() {
            pos = (pos + 1) & mask as usize;
        }
        entries[tail].next_pos_delta =
            ((pos + entries.len() - tail) & mask as usize) as u16;
        entries[pos] = entry;
    }

    fn find_last_entry_in_bucket(entries: &[Entry], start: usize, mask: u32) -> usize {
        let mut pos = start;
        while !entries[pos].is_last() {
            pos = (pos + entries[pos].next_pos_delta as usize) & mask as usize;
        }
        pos
    }
}
