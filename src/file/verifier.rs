//! Structural verification of a dex file.
//!
//! Verification runs in phases: the header check, the map check (section
//! layout), intra-section item validation (every item is self-consistent
//! without trusting cross-references), and inter-section validation (every
//! cross-reference lands on a verified item of the right type and the
//! semantic relations between items hold). The first failure aborts with a
//! descriptive error; a partially verified file is never returned.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::{
    dex_err, descriptors,
    error::DexError,
    leb128,
    utf, Result,
};

use super::{
    method_handle_type, value_type, visibility, ClassDef, DexContainer, DexFile, FieldId, Header,
    HeaderV41, MapItem, MapItemType, MethodId, ProtoId, TypeIndex, ACC_ABSTRACT, ACC_ANNOTATION,
    ACC_CONSTRUCTOR, ACC_DECLARED_SYNCHRONIZED, ACC_ENUM, ACC_FINAL, ACC_INTERFACE, ACC_NATIVE,
    ACC_PUBLIC, ACC_SYNTHETIC, DEX_ENDIAN_CONSTANT, DEX_MAGIC, DEX_MAGIC_VERSIONS, NO_INDEX,
};

pub enum VerifyPreset {
    /// Header structure only.
    None,
    /// Header structure plus the Adler32 checksum.
    ChecksumOnly,
    /// Full structural verification without the checksum.
    NoChecksum,
    /// Everything.
    All,
}

impl<'a, C: DexContainer<'a>> DexFile<'a, C> {
    pub fn is_magic_valid(&self) -> bool {
        &self.get_header().get_magic()[..4] == DEX_MAGIC
    }

    pub fn is_version_valid(&self) -> bool {
        let version_raw = &self.get_header().get_magic()[4..];
        DEX_MAGIC_VERSIONS.contains(&version_raw)
    }

    /// Adler32 over everything after the magic and checksum fields.
    pub fn calculate_checksum(&self) -> u32 {
        let data = self.data().get(12..).unwrap_or(&[]);
        adler32::adler32(data).unwrap_or(0)
    }

    /// Verifies the file according to `preset`. On success every section
    /// table, item and cross-reference has been checked; consumers may rely
    /// on indices resolving in bounds.
    pub fn verify(dex: &DexFile<'a, C>, preset: VerifyPreset) -> Result<()> {
        check_header(dex, &preset)?;
        match preset {
            VerifyPreset::None | VerifyPreset::ChecksumOnly => return Ok(()),
            VerifyPreset::NoChecksum | VerifyPreset::All => {}
        }

        debug!("verifying sections of {}", dex.get_location());
        let mut verifier = DexVerifier::new(dex);
        verifier.check_map()?;
        verifier.check_intra_sections()?;
        verifier.check_inter_sections()?;
        Ok(())
    }
}

fn check_header<'a, C>(dex: &DexFile<'a, C>, preset: &VerifyPreset) -> Result<()>
where
    C: DexContainer<'a>,
{
    let size = dex.file_size();
    if size < std::mem::size_of::<Header>() {
        return dex_err!(TruncatedFile);
    }

    if !dex.is_magic_valid() {
        return dex_err!(BadFileMagic);
    }

    if !dex.is_version_valid() {
        return dex_err!(UnknownDexVersion {
            version: dex.get_header().get_version()
        });
    }

    // check file size from header
    let header = dex.get_header();
    let version = header.get_version();
    let file_size = header.file_size as usize;
    let header_size = if version >= 41 {
        std::mem::size_of::<HeaderV41>()
    } else {
        std::mem::size_of::<Header>()
    };

    if file_size < header_size {
        return dex_err!(FileSizeAtLeast {
            actual: file_size,
            expected: header_size
        });
    }
    if file_size > size {
        return dex_err!(FileSizeAtMost {
            actual: file_size,
            expected: size
        });
    }

    // check header size
    if header.header_size as usize != header_size {
        return dex_err!(BadHeaderSize {
            size: header.header_size,
            expected: header_size as u32
        });
    }

    // check endian: a byte-swapped constant is rejected, not converted
    if header.endian_tag != DEX_ENDIAN_CONSTANT {
        return dex_err!(UnexpectedEndianess, header.endian_tag);
    }

    match preset {
        VerifyPreset::All | VerifyPreset::ChecksumOnly => {
            let checksum = dex.calculate_checksum();
            if checksum != header.checksum {
                return dex_err!(BadChecksum {
                    actual: checksum,
                    expected: header.checksum
                });
            }
        }
        _ => {}
    };

    // type and proto indices are 16-bit
    if header.type_ids_size > 0xffff {
        return dex_err!(DexFileError, "Too many type ids: {}", header.type_ids_size);
    }
    if header.proto_ids_size > 0xffff {
        return dex_err!(DexFileError, "Too many proto ids: {}", header.proto_ids_size);
    }

    check_list_bounds(dex, header.link_off, header.link_size, 1, 1, "link")?;
    check_list_bounds(dex, header.map_off, 1, 4, 4, "map")?;
    check_list_bounds(dex, header.string_ids_off, header.string_ids_size, 4, 4, "string-ids")?;
    check_list_bounds(dex, header.type_ids_off, header.type_ids_size, 4, 4, "type-ids")?;
    check_list_bounds(dex, header.proto_ids_off, header.proto_ids_size, 12, 4, "proto-ids")?;
    check_list_bounds(dex, header.field_ids_off, header.field_ids_size, 8, 4, "field-ids")?;
    check_list_bounds(dex, header.method_ids_off, header.method_ids_size, 8, 4, "method-ids")?;
    check_list_bounds(dex, header.class_defs_off, header.class_defs_size, 32, 4, "class-defs")?;
    check_list_bounds(dex, header.data_off, header.data_size, 1, 1, "data")?;
    Ok(())
}

/// `CheckValidOffsetAndSize`: an empty section must have a zero offset; a
/// non-empty one must be aligned, start past the header and fit (with an
/// overflow-checked `count * element_size`) inside the file.
fn check_list_bounds<'a, C>(
    dex: &DexFile<'a, C>,
    offset: u32,
    count: u32,
    element_size: usize,
    alignment: u32,
    label: &'static str,
) -> Result<()>
where
    C: DexContainer<'a>,
{
    if count == 0 {
        if offset != 0 {
            return dex_err!(BadOffsetNoSize {
                offset,
                section: label
            });
        }
        return Ok(());
    }

    let file_size = dex.file_size();
    let header_offset = std::mem::size_of::<Header>() as u32;
    if offset < header_offset {
        return dex_err!(BadOffsetInHeader {
            offset,
            header_size: header_offset as usize,
            section: label
        });
    }
    if offset as usize > file_size {
        return dex_err!(BadOffsetTooLarge {
            offset,
            size: file_size,
            section: label
        });
    }
    if alignment > 1 && offset % alignment != 0 {
        return dex_err!(BadAlignment {
            offset,
            alignment,
            section: label
        });
    }

    let Some(byte_size) = (count as u64).checked_mul(element_size as u64) else {
        return dex_err!(ListSizeOverflow {
            count,
            element_size,
            section: label
        });
    };
    if byte_size > (file_size - offset as usize) as u64 {
        return dex_err!(BadSection {
            offset: offset.saturating_add(byte_size.min(u32::MAX as u64) as u32),
            size: file_size,
            section: label
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Bounded cursor
// ----------------------------------------------------------------------------

/// Safe sequential reader over `[start, limit)` of the file. Every read is
/// bounds-checked; nothing here can touch a byte past `limit`.
struct Cursor<'b> {
    data: &'b [u8],
    pos: usize,
    limit: usize,
    what: &'static str,
}

impl<'b> Cursor<'b> {
    fn new(data: &'b [u8], start: usize, limit: usize, what: &'static str) -> Self {
        Self {
            data,
            pos: start,
            limit: limit.min(data.len()),
            what,
        }
    }

    #[inline]
    fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.pos)
    }

    fn fail_short(&self, wanted: usize) -> DexError {
        DexError::BadSection {
            offset: (self.pos + wanted) as u32,
            size: self.limit,
            section: self.what,
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(self.fail_short(1));
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(self.fail_short(2));
        }
        let v = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(self.fail_short(4));
        }
        let b = &self.data[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a little-endian unsigned integer of `width` bytes (1..=8).
    fn read_le_uint(&mut self, width: usize) -> Result<u64> {
        if self.remaining() < width {
            return Err(self.fail_short(width));
        }
        let mut v: u64 = 0;
        for i in 0..width {
            v |= (self.data[self.pos + i] as u64) << (i * 8);
        }
        self.pos += width;
        Ok(v)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(self.fail_short(n));
        }
        self.pos += n;
        Ok(())
    }

    fn align4(&mut self) -> Result<()> {
        let aligned = (self.pos + 3) & !3;
        if aligned > self.limit {
            return Err(self.fail_short(aligned - self.pos));
        }
        self.pos = aligned;
        Ok(())
    }

    fn uleb(&mut self) -> Result<u32> {
        let end = self.limit.min(self.data.len());
        if self.pos >= end {
            return dex_err!(TruncatedLeb128 {
                offset: self.pos,
                item_ty: self.what
            });
        }
        leb128::decode_leb128_at::<u32>(&self.data[..end], &mut self.pos)
    }

    fn uleb_p1(&mut self) -> Result<i32> {
        let v = self.uleb()?;
        Ok(v.wrapping_sub(1) as i32)
    }

    fn sleb(&mut self) -> Result<i32> {
        let end = self.limit.min(self.data.len());
        leb128::decode_sleb128(&self.data[..end], &mut self.pos)
    }
}

// ----------------------------------------------------------------------------
// DexVerifier
// ----------------------------------------------------------------------------

/// Mandatory map sections and the header fields they must agree with.
struct IdSectionSpec {
    ty: MapItemType,
    header_size: u32,
    header_off: u32,
}

pub struct DexVerifier<'v, 'a, C: DexContainer<'a>> {
    dex: &'v DexFile<'a, C>,
    data: &'a [u8],

    /// start offset -> section type, for every item verified in the intra
    /// pass. Cross-references may only land on these.
    offset_map: HashMap<u32, MapItemType>,

    /// (offset, required type, label) collected during the intra pass and
    /// resolved against `offset_map` once it is complete.
    deferred: Vec<(u32, MapItemType, &'static str)>,

    /// type indices defined by class defs, accumulated in the inter pass.
    defined_classes: HashSet<TypeIndex>,
}

const MAX_ENCODED_VALUE_DEPTH: u32 = 100;

/// Flags that may appear on a class definition.
const CLASS_ACCESS_FLAGS: u32 = ACC_PUBLIC
    | ACC_FINAL
    | ACC_INTERFACE
    | ACC_ABSTRACT
    | ACC_SYNTHETIC
    | ACC_ANNOTATION
    | ACC_ENUM;

const FIELD_ACCESS_FLAGS: u32 = 0xffff & !(0x0020 | 0x0100 | 0x0200 | 0x0400 | 0x0800 | 0x2000);
const METHOD_ACCESS_FLAGS: u32 =
    0xffff & !(0x0200 | 0x2000 | 0x4000) | ACC_CONSTRUCTOR | ACC_DECLARED_SYNCHRONIZED;

impl<'v, 'a, C: DexContainer<'a>> DexVerifier<'v, 'a, C> {
    pub fn new(dex: &'v DexFile<'a, C>) -> Self {
        Self {
            dex,
            data: dex.data(),
            offset_map: HashMap::new(),
            deferred: Vec::new(),
            defined_classes: HashSet::new(),
        }
    }

    #[inline]
    fn header(&self) -> &Header {
        self.dex.get_header()
    }

    fn check_index(&self, index: u32, max: u32, item_ty: &'static str) -> Result<()> {
        if index >= max {
            return dex_err!(DexIndexError {
                index,
                max: max as usize,
                item_ty
            });
        }
        Ok(())
    }

    fn map_items(&self) -> Result<&'a [MapItem]> {
        let map_off = self.header().map_off;
        let count: &u32 = self.dex.non_null_data_ptr(map_off)?;
        let items_off = map_off + std::mem::size_of::<u32>() as u32;
        self.dex.non_null_array_data_ptr(items_off, *count as usize)
    }

    // ------------------------------------------------------------------
    // map check
    // ------------------------------------------------------------------

    pub fn check_map(&mut self) -> Result<()> {
        let header = self.header();
        check_list_bounds(self.dex, header.map_off, 1, 4, 4, "map")?;
        if header.map_off == 0 {
            return dex_err!(BadOffsetNoSize {
                offset: 0,
                section: "map"
            });
        }

        let items = self.map_items()?;
        check_list_bounds(
            self.dex,
            header.map_off + 4,
            items.len() as u32,
            std::mem::size_of::<MapItem>(),
            4,
            "map-items",
        )?;

        let mut seen: HashSet<u16> = HashSet::new();
        let mut last_offset: u32 = 0;
        for (i, item) in items.iter().enumerate() {
            if i > 0 && item.off <= last_offset {
                return dex_err!(OutOfOrderMapItem {
                    type_code: item.type_code,
                    offset: item.off,
                    prev_offset: last_offset
                });
            }
            last_offset = item.off;

            let Some(ty) = item.map_type() else {
                return dex_err!(UnknownMapSectionType {
                    type_code: item.type_code,
                    offset: item.off
                });
            };
            if !seen.insert(item.type_code) {
                return dex_err!(DuplicateMapSection {
                    type_code: item.type_code
                });
            }

            if item.off as usize > self.data.len() {
                return dex_err!(BadOffsetTooLarge {
                    offset: item.off,
                    size: self.data.len(),
                    section: "map-item"
                });
            }
            let alignment = ty.alignment();
            if alignment > 1 && item.off % alignment != 0 {
                return dex_err!(BadAlignment {
                    offset: item.off,
                    alignment,
                    section: "map-item"
                });
            }
        }

        // the header and the map list itself must be present
        let find = |ty: MapItemType| items.iter().find(|i| i.map_type() == Some(ty));
        let Some(header_item) = find(MapItemType::HeaderItem) else {
            return dex_err!(MissingMapSection {
                type_code: MapItemType::HeaderItem as u16
            });
        };
        if header_item.off != 0 || header_item.size != 1 {
            return dex_err!(MapSectionMismatch {
                type_code: MapItemType::HeaderItem as u16,
                map_size: header_item.size,
                map_off: header_item.off,
                header_size: 1,
                header_off: 0
            });
        }
        let Some(map_item) = find(MapItemType::MapList) else {
            return dex_err!(MissingMapSection {
                type_code: MapItemType::MapList as u16
            });
        };
        if map_item.off != header.map_off || map_item.size != 1 {
            return dex_err!(MapSectionMismatch {
                type_code: MapItemType::MapList as u16,
                map_size: map_item.size,
                map_off: map_item.off,
                header_size: 1,
                header_off: header.map_off
            });
        }

        // id sections must be present iff the header declares them, with
        // matching counts and offsets
        let specs = [
            IdSectionSpec {
                ty: MapItemType::StringIdItem,
                header_size: header.string_ids_size,
                header_off: header.string_ids_off,
            },
            IdSectionSpec {
                ty: MapItemType::TypeIdItem,
                header_size: header.type_ids_size,
                header_off: header.type_ids_off,
            },
            IdSectionSpec {
                ty: MapItemType::ProtoIdItem,
                header_size: header.proto_ids_size,
                header_off: header.proto_ids_off,
            },
            IdSectionSpec {
                ty: MapItemType::FieldIdItem,
                header_size: header.field_ids_size,
                header_off: header.field_ids_off,
            },
            IdSectionSpec {
                ty: MapItemType::MethodIdItem,
                header_size: header.method_ids_size,
                header_off: header.method_ids_off,
            },
            IdSectionSpec {
                ty: MapItemType::ClassDefItem,
                header_size: header.class_defs_size,
                header_off: header.class_defs_off,
            },
        ];
        for spec in &specs {
            match find(spec.ty) {
                Some(item) => {
                    if item.size != spec.header_size || item.off != spec.header_off {
                        return dex_err!(MapSectionMismatch {
                            type_code: spec.ty as u16,
                            map_size: item.size,
                            map_off: item.off,
                            header_size: spec.header_size,
                            header_off: spec.header_off
                        });
                    }
                }
                None => {
                    if spec.header_size != 0 || spec.header_off != 0 {
                        return dex_err!(MissingMapSection {
                            type_code: spec.ty as u16
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // intra-section checks
    // ------------------------------------------------------------------

    pub fn check_intra_sections(&mut self) -> Result<()> {
        let items = self.map_items()?;
        for (i, item) in items.iter().enumerate() {
            // sections must tile without overlap: each walk is bounded by
            // the start of the next section (or the end of the file)
            let limit = items
                .get(i + 1)
                .map(|next| next.off as usize)
                .unwrap_or(self.data.len());
            let ty = item.map_type().expect("checked by check_map");
            match ty {
                MapItemType::HeaderItem
                | MapItemType::StringIdItem
                | MapItemType::TypeIdItem
                | MapItemType::ProtoIdItem
                | MapItemType::FieldIdItem
                | MapItemType::MethodIdItem
                | MapItemType::ClassDefItem
                | MapItemType::CallSiteIdItem
                | MapItemType::MethodHandleItem
                | MapItemType::MapList
                | MapItemType::HiddenapiClassData => {
                    // fixed-stride tables; bounds were checked against the
                    // header and the map, contents are checked inter-section
                }
                MapItemType::TypeList => {
                    self.check_intra_type_lists(item, limit)?;
                }
                MapItemType::StringDataItem => {
                    self.check_intra_string_data(item, limit)?;
                }
                MapItemType::ClassDataItem => {
                    self.check_intra_class_data(item, limit)?;
                }
                MapItemType::CodeItem => {
                    self.check_intra_code_items(item, limit)?;
                }
                MapItemType::AnnotationItem => {
                    self.check_intra_annotation_items(item, limit)?;
                }
                MapItemType::EncodedArrayItem => {
                    self.check_intra_encoded_arrays(item, limit)?;
                }
                MapItemType::AnnotationSetItem => {
                    self.check_intra_annotation_sets(item, limit)?;
                }
                MapItemType::AnnotationSetRefList => {
                    self.check_intra_annotation_set_refs(item, limit)?;
                }
                MapItemType::AnnotationsDirectoryItem => {
                    self.check_intra_annotations_directories(item, limit)?;
                }
                MapItemType::DebugInfoItem => {
                    self.check_intra_debug_info(item, limit)?;
                }
            }
        }

        // cross-section offsets recorded during the walk resolve only now,
        // since a referenced section may come later in the file
        let deferred = std::mem::take(&mut self.deferred);
        for (offset, expected_ty, label) in deferred {
            if self.offset_map.get(&offset) != Some(&expected_ty) {
                return dex_err!(BadItemOffset {
                    offset,
                    expected: label
                });
            }
        }
        Ok(())
    }

    fn defer(&mut self, offset: u32, ty: MapItemType, label: &'static str) {
        self.deferred.push((offset, ty, label));
    }

    fn check_intra_string_data(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        let mut cursor = Cursor::new(self.data, item.off as usize, limit, "string_data_item");
        for _ in 0..item.size {
            let start = cursor.pos();
            let declared = cursor.uleb()?;

            // find the terminating NUL inside the section
            let body_start = cursor.pos();
            let Some(nul) = self.data[body_start..cursor.limit].iter().position(|b| *b == 0)
            else {
                return dex_err!(BadStringDataMissingNullByte, body_start);
            };
            utf::check_mutf8(
                &self.data[body_start..body_start + nul],
                declared,
                body_start,
            )?;
            cursor.skip(nul + 1)?;
            self.offset_map.insert(start as u32, MapItemType::StringDataItem);
        }
        Ok(())
    }

    fn check_intra_type_lists(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        let num_types = self.header().type_ids_size;
        let mut cursor = Cursor::new(self.data, item.off as usize, limit, "type_list");
        for _ in 0..item.size {
            cursor.align4()?;
            let start = cursor.pos();
            let count = cursor.read_u32()?;
            for _ in 0..count {
                let type_idx = cursor.read_u16()?;
                self.check_index(type_idx as u32, num_types, "type_list entry")?;
            }
            self.offset_map.insert(start as u32, MapItemType::TypeList);
        }
        Ok(())
    }

    fn check_intra_class_data(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        let header = self.header();
        let num_fields = header.field_ids_size;
        let num_methods = header.method_ids_size;
        let mut cursor = Cursor::new(self.data, item.off as usize, limit, "class_data_item");
        for _ in 0..item.size {
            let start = cursor.pos();
            let num_static_fields = cursor.uleb()?;
            let num_instance_fields = cursor.uleb()?;
            let num_direct_methods = cursor.uleb()?;
            let num_virtual_methods = cursor.uleb()?;

            self.check_class_data_fields(&mut cursor, num_static_fields, num_fields)?;
            self.check_class_data_fields(&mut cursor, num_instance_fields, num_fields)?;
            self.check_class_data_methods(&mut cursor, num_direct_methods, num_methods)?;
            self.check_class_data_methods(&mut cursor, num_virtual_methods, num_methods)?;

            self.offset_map.insert(start as u32, MapItemType::ClassDataItem);
        }
        Ok(())
    }

    /// Member indices are delta-encoded; the accumulated index must not
    /// overflow and subsequent entries must be strictly increasing.
    fn check_class_data_fields(
        &mut self,
        cursor: &mut Cursor<'_>,
        count: u32,
        num_field_ids: u32,
    ) -> Result<()> {
        let mut index: u32 = 0;
        for i in 0..count {
            let delta = cursor.uleb()?;
            if i > 0 && delta == 0 {
                return dex_err!(OutOfOrderIndex {
                    item_ty: "class_data field",
                    prev: index,
                    current: index
                });
            }
            index = match index.checked_add(delta) {
                Some(v) => v,
                None => {
                    return dex_err!(BadEncodedIndex {
                        index,
                        next_index: delta,
                        item_ty: "class_data field"
                    })
                }
            };
            self.check_index(index, num_field_ids, "class_data field")?;

            let access_flags = cursor.uleb()?;
            if access_flags & !FIELD_ACCESS_FLAGS != 0 {
                return dex_err!(BadAccessFlags {
                    flags: access_flags,
                    item_ty: "field"
                });
            }
        }
        Ok(())
    }

    fn check_class_data_methods(
        &mut self,
        cursor: &mut Cursor<'_>,
        count: u32,
        num_method_ids: u32,
    ) -> Result<()> {
        let mut index: u32 = 0;
        for i in 0..count {
            let delta = cursor.uleb()?;
            if i > 0 && delta == 0 {
                return dex_err!(OutOfOrderIndex {
                    item_ty: "class_data method",
                    prev: index,
                    current: index
                });
            }
            index = match index.checked_add(delta) {
                Some(v) => v,
                None => {
                    return dex_err!(BadEncodedIndex {
                        index,
                        next_index: delta,
                        item_ty: "class_data method"
                    })
                }
            };
            self.check_index(index, num_method_ids, "class_data method")?;

            let access_flags = cursor.uleb()?;
            if access_flags & !METHOD_ACCESS_FLAGS != 0 {
                return dex_err!(BadAccessFlags {
                    flags: access_flags,
                    item_ty: "method"
                });
            }

            let code_off = cursor.uleb()?;
            let expects_code = access_flags & (ACC_ABSTRACT | ACC_NATIVE) == 0;
            if expects_code && code_off == 0 {
                return dex_err!(
                    BadClassData,
                    "method {} has no code but is neither abstract nor native",
                    index
                );
            }
            if !expects_code && code_off != 0 {
                return dex_err!(
                    BadClassData,
                    "abstract or native method {} must not have code",
                    index
                );
            }
            if code_off != 0 {
                self.defer(code_off, MapItemType::CodeItem, "code_item");
            }
        }
        Ok(())
    }

    fn check_intra_code_items(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        let num_types = self.header().type_ids_size;
        let mut cursor = Cursor::new(self.data, item.off as usize, limit, "code_item");
        for _ in 0..item.size {
            cursor.align4()?;
            let start = cursor.pos();

            let registers_size = cursor.read_u16()?;
            let ins_size = cursor.read_u16()?;
            let _outs_size = cursor.read_u16()?;
            let tries_size = cursor.read_u16()?;
            let debug_info_off = cursor.read_u32()?;
            let insns_size = cursor.read_u32()?;

            if ins_size > registers_size {
                return dex_err!(
                    BadCodeItem,
                    "ins_size ({}) > registers_size ({}) at offset {}",
                    ins_size,
                    registers_size,
                    start
                );
            }

            let Some(insns_bytes) = (insns_size as u64).checked_mul(2) else {
                return dex_err!(ListSizeOverflow {
                    count: insns_size,
                    element_size: 2,
                    section: "insns"
                });
            };
            if insns_bytes > cursor.remaining() as u64 {
                return dex_err!(BadSection {
                    offset: (cursor.pos() as u64 + insns_bytes).min(u32::MAX as u64) as u32,
                    size: cursor.limit,
                    section: "insns"
                });
            }
            cursor.skip(insns_bytes as usize)?;

            if debug_info_off != 0 {
                self.defer(debug_info_off, MapItemType::DebugInfoItem, "debug_info_item");
            }

            if tries_size != 0 {
                self.check_code_item_tries(&mut cursor, tries_size, insns_size, num_types)?;
            }

            self.offset_map.insert(start as u32, MapItemType::CodeItem);
        }
        Ok(())
    }

    fn check_code_item_tries(
        &mut self,
        cursor: &mut Cursor<'_>,
        tries_size: u16,
        insns_size: u32,
        num_types: u32,
    ) -> Result<()> {
        cursor.align4()?;

        // try items first, handlers after; handler offsets are validated
        // against the set of handler starts actually decoded
        let mut tries = Vec::with_capacity(tries_size as usize);
        for _ in 0..tries_size {
            let start_addr = cursor.read_u32()?;
            let insn_count = cursor.read_u16()?;
            let handler_off = cursor.read_u16()?;
            tries.push((start_addr, insn_count, handler_off));
        }

        let handlers_base = cursor.pos();
        let handlers_size = cursor.uleb()?;
        // each handler consumes at least one byte; anything bigger than the
        // remaining bytes is certainly malformed
        if handlers_size as usize > cursor.remaining() {
            return dex_err!(
                BadCodeItem,
                "handler list size {} exceeds remaining code item bytes",
                handlers_size
            );
        }
        let mut handler_starts: HashSet<usize> = HashSet::with_capacity(handlers_size as usize);
        for _ in 0..handlers_size {
            handler_starts.insert(cursor.pos() - handlers_base);
            let size = cursor.sleb()?;
            let type_count = size.unsigned_abs();
            for _ in 0..type_count {
                let type_idx = cursor.uleb()?;
                self.check_index(type_idx, num_types, "catch handler type")?;
                let addr = cursor.uleb()?;
                if addr >= insns_size {
                    return dex_err!(
                        BadCodeItem,
                        "catch handler address {} outside insns size {}",
                        addr,
                        insns_size
                    );
                }
            }
            if size <= 0 {
                let addr = cursor.uleb()?;
                if addr >= insns_size {
                    return dex_err!(
                        BadCodeItem,
                        "catch-all address {} outside insns size {}",
                        addr,
                        insns_size
                    );
                }
            }
        }

        let mut last_end: u32 = 0;
        for (start_addr, insn_count, handler_off) in tries {
            if start_addr < last_end {
                return dex_err!(
                    BadCodeItem,
                    "out-of-order or overlapping try item at address {}",
                    start_addr
                );
            }
            let end = start_addr as u64 + insn_count as u64;
            if end > insns_size as u64 {
                return dex_err!(
                    BadCodeItem,
                    "try item [{}; {}) extends past insns size {}",
                    start_addr,
                    end,
                    insns_size
                );
            }
            last_end = end as u32;
            if !handler_starts.contains(&(handler_off as usize)) {
                return dex_err!(
                    BadCodeItem,
                    "try item handler offset {} does not point at a handler",
                    handler_off
                );
            }
        }
        Ok(())
    }

    fn check_intra_annotation_items(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        let mut cursor = Cursor::new(self.data, item.off as usize, limit, "annotation_item");
        for _ in 0..item.size {
            let start = cursor.pos();
            let vis = cursor.read_u8()?;
            if !matches!(vis, visibility::BUILD | visibility::RUNTIME | visibility::SYSTEM) {
                return dex_err!(BadAnnotationVisibility, vis);
            }
            self.check_encoded_annotation(&mut cursor, 0)?;
            self.offset_map.insert(start as u32, MapItemType::AnnotationItem);
        }
        Ok(())
    }

    fn check_intra_encoded_arrays(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        let mut cursor = Cursor::new(self.data, item.off as usize, limit, "encoded_array_item");
        for _ in 0..item.size {
            let start = cursor.pos();
            self.check_encoded_array(&mut cursor, 0)?;
            self.offset_map.insert(start as u32, MapItemType::EncodedArrayItem);
        }
        Ok(())
    }

    fn check_encoded_array(&mut self, cursor: &mut Cursor<'_>, depth: u32) -> Result<()> {
        let count = cursor.uleb()?;
        for _ in 0..count {
            self.check_encoded_value(cursor, depth + 1)?;
        }
        Ok(())
    }

    fn check_encoded_annotation(&mut self, cursor: &mut Cursor<'_>, depth: u32) -> Result<()> {
        let num_types = self.header().type_ids_size;
        let num_strings = self.header().string_ids_size;
        let type_idx = cursor.uleb()?;
        self.check_index(type_idx, num_types, "encoded_annotation type")?;
        let count = cursor.uleb()?;
        let mut last_idx: Option<u32> = None;
        for _ in 0..count {
            let name_idx = cursor.uleb()?;
            self.check_index(name_idx, num_strings, "annotation element name")?;
            if let Some(last) = last_idx {
                if last >= name_idx {
                    return dex_err!(OutOfOrderIndex {
                        item_ty: "annotation element",
                        prev: last,
                        current: name_idx
                    });
                }
            }
            last_idx = Some(name_idx);
            self.check_encoded_value(cursor, depth + 1)?;
        }
        Ok(())
    }

    fn check_encoded_value(&mut self, cursor: &mut Cursor<'_>, depth: u32) -> Result<()> {
        if depth > MAX_ENCODED_VALUE_DEPTH {
            return dex_err!(
                DexFileError,
                "encoded value nesting exceeds {} levels",
                MAX_ENCODED_VALUE_DEPTH
            );
        }

        let header = self.header();
        let pos = cursor.pos();
        let leading = cursor.read_u8()?;
        let ty = leading & 0x1f;
        let arg = leading >> 5;

        let check_arg = |max: u8| -> Result<()> {
            if arg > max {
                return dex_err!(BadEncodedValueArg {
                    value_type: ty,
                    value_arg: arg
                });
            }
            Ok(())
        };

        match ty {
            value_type::BYTE => {
                check_arg(0)?;
                cursor.skip(1)?;
            }
            value_type::SHORT | value_type::CHAR => {
                check_arg(1)?;
                cursor.skip(arg as usize + 1)?;
            }
            value_type::INT | value_type::FLOAT => {
                check_arg(3)?;
                cursor.skip(arg as usize + 1)?;
            }
            value_type::LONG | value_type::DOUBLE => {
                check_arg(7)?;
                cursor.skip(arg as usize + 1)?;
            }
            value_type::METHOD_TYPE => {
                check_arg(3)?;
                let idx = cursor.read_le_uint(arg as usize + 1)? as u32;
                self.check_index(idx, header.proto_ids_size, "encoded method type")?;
            }
            value_type::METHOD_HANDLE => {
                check_arg(3)?;
                let idx = cursor.read_le_uint(arg as usize + 1)? as u32;
                self.check_index(idx, self.dex.num_method_handles(), "encoded method handle")?;
            }
            value_type::STRING => {
                check_arg(3)?;
                let idx = cursor.read_le_uint(arg as usize + 1)? as u32;
                self.check_index(idx, header.string_ids_size, "encoded string")?;
            }
            value_type::TYPE => {
                check_arg(3)?;
                let idx = cursor.read_le_uint(arg as usize + 1)? as u32;
                self.check_index(idx, header.type_ids_size, "encoded type")?;
            }
            value_type::FIELD | value_type::ENUM => {
                check_arg(3)?;
                let idx = cursor.read_le_uint(arg as usize + 1)? as u32;
                self.check_index(idx, header.field_ids_size, "encoded field")?;
            }
            value_type::METHOD => {
                check_arg(3)?;
                let idx = cursor.read_le_uint(arg as usize + 1)? as u32;
                self.check_index(idx, header.method_ids_size, "encoded method")?;
            }
            value_type::ARRAY => {
                check_arg(0)?;
                self.check_encoded_array(cursor, depth)?;
            }
            value_type::ANNOTATION => {
                check_arg(0)?;
                self.check_encoded_annotation(cursor, depth)?;
            }
            value_type::NULL => {
                check_arg(0)?;
            }
            value_type::BOOLEAN => {
                check_arg(1)?;
            }
            _ => {
                return dex_err!(BadEncodedValueType {
                    value_type: ty,
                    offset: pos
                });
            }
        }
        Ok(())
    }

    fn check_intra_annotation_sets(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        let mut cursor = Cursor::new(self.data, item.off as usize, limit, "annotation_set_item");
        for _ in 0..item.size {
            cursor.align4()?;
            let start = cursor.pos();
            let count = cursor.read_u32()?;
            for _ in 0..count {
                let off = cursor.read_u32()?;
                self.defer(off, MapItemType::AnnotationItem, "annotation_item");
            }
            self.offset_map.insert(start as u32, MapItemType::AnnotationSetItem);
        }
        Ok(())
    }

    fn check_intra_annotation_set_refs(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        let mut cursor = Cursor::new(self.data, item.off as usize, limit, "annotation_set_ref_list");
        for _ in 0..item.size {
            cursor.align4()?;
            let start = cursor.pos();
            let count = cursor.read_u32()?;
            for _ in 0..count {
                let off = cursor.read_u32()?;
                if off != 0 {
                    self.defer(off, MapItemType::AnnotationSetItem, "annotation_set_item");
                }
            }
            self.offset_map
                .insert(start as u32, MapItemType::AnnotationSetRefList);
        }
        Ok(())
    }

    fn check_intra_annotations_directories(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        let header_counts = (
            self.header().field_ids_size,
            self.header().method_ids_size,
        );
        let mut cursor = Cursor::new(
            self.data,
            item.off as usize,
            limit,
            "annotations_directory_item",
        );
        for _ in 0..item.size {
            cursor.align4()?;
            let start = cursor.pos();
            let class_annotations_off = cursor.read_u32()?;
            let fields_size = cursor.read_u32()?;
            let methods_size = cursor.read_u32()?;
            let parameters_size = cursor.read_u32()?;

            if class_annotations_off != 0 {
                self.defer(
                    class_annotations_off,
                    MapItemType::AnnotationSetItem,
                    "annotation_set_item",
                );
            }

            let mut last_idx: Option<u32> = None;
            for _ in 0..fields_size {
                let field_idx = cursor.read_u32()?;
                let annotations_off = cursor.read_u32()?;
                self.check_index(field_idx, header_counts.0, "field annotation")?;
                if let Some(last) = last_idx {
                    if last >= field_idx {
                        return dex_err!(OutOfOrderIndex {
                            item_ty: "field annotation",
                            prev: last,
                            current: field_idx
                        });
                    }
                }
                last_idx = Some(field_idx);
                self.defer(annotations_off, MapItemType::AnnotationSetItem, "annotation_set_item");
            }

            let mut last_idx: Option<u32> = None;
            for _ in 0..methods_size {
                let method_idx = cursor.read_u32()?;
                let annotations_off = cursor.read_u32()?;
                self.check_index(method_idx, header_counts.1, "method annotation")?;
                if let Some(last) = last_idx {
                    if last >= method_idx {
                        return dex_err!(OutOfOrderIndex {
                            item_ty: "method annotation",
                            prev: last,
                            current: method_idx
                        });
                    }
                }
                last_idx = Some(method_idx);
                self.defer(annotations_off, MapItemType::AnnotationSetItem, "annotation_set_item");
            }

            let mut last_idx: Option<u32> = None;
            for _ in 0..parameters_size {
                let method_idx = cursor.read_u32()?;
                let annotations_off = cursor.read_u32()?;
                self.check_index(method_idx, header_counts.1, "parameter annotation")?;
                if let Some(last) = last_idx {
                    if last >= method_idx {
                        return dex_err!(OutOfOrderIndex {
                            item_ty: "parameter annotation",
                            prev: last,
                            current: method_idx
                        });
                    }
                }
                last_idx = Some(method_idx);
                self.defer(
                    annotations_off,
                    MapItemType::AnnotationSetRefList,
                    "annotation_set_ref_list",
                );
            }

            self.offset_map
                .insert(start as u32, MapItemType::AnnotationsDirectoryItem);
        }
        Ok(())
    }

    fn check_intra_debug_info(&mut self, item: &MapItem, limit: usize) -> Result<()> {
        use super::debug::code::*;

        let num_strings = self.header().string_ids_size;
        let num_types = self.header().type_ids_size;
        let mut cursor = Cursor::new(self.data, item.off as usize, limit, "debug_info_item");

        let check_string_p1 = |this: &Self, idx: i32| -> Result<()> {
            if idx >= 0 {
                this.check_index(idx as u32, num_strings, "debug info string")?;
            }
            Ok(())
        };

        for _ in 0..item.size {
            let start = cursor.pos();
            let _line_start = cursor.uleb()?;
            let parameters_size = cursor.uleb()?;
            for _ in 0..parameters_size {
                let name_idx = cursor.uleb_p1()?;
                check_string_p1(self, name_idx)?;
            }

            loop {
                let opcode = cursor.read_u8()?;
                match opcode {
                    DBG_END_SEQUENCE => break,
                    DBG_ADVANCE_PC => {
                        cursor.uleb()?;
                    }
                    DBG_ADVANCE_LINE => {
                        cursor.sleb()?;
                    }
                    DBG_START_LOCAL => {
                        let reg = cursor.uleb()?;
                        if reg > u16::MAX as u32 {
                            return dex_err!(BadDebugInfo, format!("bad register {reg} in DBG_START_LOCAL"));
                        }
                        check_string_p1(self, cursor.uleb_p1()?)?;
                        let type_idx = cursor.uleb_p1()?;
                        if type_idx >= 0 {
                            self.check_index(type_idx as u32, num_types, "debug info type")?;
                        }
                    }
                    DBG_START_LOCAL_EXTENDED => {
                        let reg = cursor.uleb()?;
                        if reg > u16::MAX as u32 {
                            return dex_err!(
                                BadDebugInfo,
                                format!("bad register {reg} in DBG_START_LOCAL_EXTENDED")
                            );
                        }
                        check_string_p1(self, cursor.uleb_p1()?)?;
                        let type_idx = cursor.uleb_p1()?;
                        if type_idx >= 0 {
                            self.check_index(type_idx as u32, num_types, "debug info type")?;
                        }
                        check_string_p1(self, cursor.uleb_p1()?)?;
                    }
                    DBG_END_LOCAL | DBG_RESTART_LOCAL => {
                        let reg = cursor.uleb()?;
                        if reg > u16::MAX as u32 {
                            return dex_err!(BadDebugInfo, format!("bad register {reg} in local opcode"));
                        }
                    }
                    DBG_SET_PROLOGUE_END | DBG_SET_EPILOGUE_BEGIN => {}
                    DBG_SET_FILE => {
                        check_string_p1(self, cursor.uleb_p1()?)?;
                    }
                    _ => {
                        // special opcodes 0x0a..=0xff carry no operands
                    }
                }
            }

            self.offset_map.insert(start as u32, MapItemType::DebugInfoItem);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // inter-section checks
    // ------------------------------------------------------------------

    pub fn check_inter_sections(&mut self) -> Result<()> {
        self.check_inter_string_ids()?;
        self.check_inter_type_ids()?;
        self.check_inter_proto_ids()?;
        self.check_inter_field_ids()?;
        self.check_inter_method_ids()?;
        self.check_inter_class_defs()?;
        self.check_inter_call_sites()?;
        self.check_inter_method_handles()?;
        self.check_inter_annotation_sets()?;
        Ok(())
    }

    /// Reads and validates the descriptor string for a type index.
    fn type_descriptor(&self, type_idx: TypeIndex, item_ty: &'static str) -> Result<String> {
        let type_id = self.dex.get_type_id(type_idx)?;
        let descriptor = self.dex.get_utf16_str_at(type_id.descriptor_idx)?;
        if !descriptors::is_valid_type_descriptor(&descriptor) {
            return dex_err!(BadDescriptor {
                item_ty,
                descriptor
            });
        }
        Ok(descriptor)
    }

    fn class_descriptor(&self, type_idx: TypeIndex, item_ty: &'static str) -> Result<String> {
        let type_id = self.dex.get_type_id(type_idx)?;
        let descriptor = self.dex.get_utf16_str_at(type_id.descriptor_idx)?;
        if !descriptors::is_valid_class_descriptor(&descriptor) {
            return dex_err!(BadDescriptor {
                item_ty,
                descriptor
            });
        }
        Ok(descriptor)
    }

    fn check_inter_string_ids(&mut self) -> Result<()> {
        let mut prev: Option<&[u8]> = None;
        for string_id in self.dex.string_ids() {
            if self.offset_map.get(&string_id.string_data_off) != Some(&MapItemType::StringDataItem)
            {
                return dex_err!(BadItemOffset {
                    offset: string_id.string_data_off,
                    expected: "string_data_item"
                });
            }
            let (_, data) = self.dex.get_string_data(string_id)?;
            if let Some(prev_data) = prev {
                if utf::compare_mutf8_as_utf16(prev_data, data) != std::cmp::Ordering::Less {
                    return dex_err!(
                        DexFileError,
                        "string ids are not sorted: {:?} before {:?}",
                        utf::mutf8_to_str_lossy(prev_data),
                        utf::mutf8_to_str_lossy(data)
                    );
                }
            }
            prev = Some(data);
        }
        Ok(())
    }

    fn check_inter_type_ids(&mut self) -> Result<()> {
        let mut prev: Option<u32> = None;
        for (i, type_id) in self.dex.get_type_ids().iter().enumerate() {
            self.check_index(
                type_id.descriptor_idx,
                self.header().string_ids_size,
                "type_id descriptor",
            )?;
            self.type_descriptor(i as TypeIndex, "type_id")?;
            if let Some(prev_idx) = prev {
                if prev_idx >= type_id.descriptor_idx {
                    return dex_err!(OutOfOrderIndex {
                        item_ty: "type_id",
                        prev: prev_idx,
                        current: type_id.descriptor_idx
                    });
                }
            }
            prev = Some(type_id.descriptor_idx);
        }
        Ok(())
    }

    /// Shorty characters must agree with the return and parameter type
    /// descriptors, and protos must be sorted by return type then
    /// parameters.
    fn check_inter_proto_ids(&mut self) -> Result<()> {
        let mut prev: Option<&ProtoId> = None;
        for proto_id in self.dex.get_proto_ids() {
            self.check_index(
                proto_id.shorty_idx,
                self.header().string_ids_size,
                "proto_id shorty",
            )?;
            let shorty = self.dex.get_shorty(proto_id)?;
            let shorty_bytes = shorty.as_bytes();
            if shorty_bytes.is_empty() {
                return dex_err!(BadDescriptor {
                    item_ty: "proto_id shorty",
                    descriptor: shorty
                });
            }

            let return_desc = self.type_descriptor(proto_id.return_type_idx, "proto_id return")?;
            if !descriptors::shorty_matches(shorty_bytes[0], &return_desc) {
                return dex_err!(ShortyMismatch {
                    shorty,
                    descriptor: return_desc,
                    pos: 0
                });
            }

            if proto_id.parameters_off != 0
                && self.offset_map.get(&proto_id.parameters_off) != Some(&MapItemType::TypeList)
            {
                return dex_err!(BadItemOffset {
                    offset: proto_id.parameters_off,
                    expected: "type_list"
                });
            }
            let params = self.dex.get_type_list(proto_id.parameters_off)?;
            let param_count = params.map(|p| p.len()).unwrap_or(0);
            if shorty_bytes.len() != param_count + 1 {
                return dex_err!(
                    DexFileError,
                    "shorty {:?} length does not match {} parameters",
                    shorty,
                    param_count
                );
            }
            if let Some(params) = params {
                for (i, item) in params.iter().enumerate() {
                    let param_desc = self.type_descriptor(item.type_idx, "proto_id parameter")?;
                    if param_desc == "V" {
                        return dex_err!(BadDescriptor {
                            item_ty: "proto_id parameter",
                            descriptor: param_desc
                        });
                    }
                    if !descriptors::shorty_matches(shorty_bytes[i + 1], &param_desc) {
                        return dex_err!(ShortyMismatch {
                            shorty,
                            descriptor: param_desc,
                            pos: i + 1
                        });
                    }
                }
            }

            if let Some(prev_id) = prev {
                if self.compare_protos(prev_id, proto_id)? != std::cmp::Ordering::Less {
                    return dex_err!(OutOfOrderIndex {
                        item_ty: "proto_id",
                        prev: prev_id.return_type_idx as u32,
                        current: proto_id.return_type_idx as u32
                    });
                }
            }
            prev = Some(proto_id);
        }
        Ok(())
    }

    fn compare_protos(&self, a: &ProtoId, b: &ProtoId) -> Result<std::cmp::Ordering> {
        use std::cmp::Ordering;
        match a.return_type_idx.cmp(&b.return_type_idx) {
            Ordering::Equal => {}
            other => return Ok(other),
        }
        let empty: &[super::TypeItem] = &[];
        let params_a = self.dex.get_type_list(a.parameters_off)?.unwrap_or(empty);
        let params_b = self.dex.get_type_list(b.parameters_off)?.unwrap_or(empty);
        let ord = params_a
            .iter()
            .map(|t| t.type_idx)
            .cmp(params_b.iter().map(|t| t.type_idx));
        Ok(ord)
    }

    fn check_inter_field_ids(&mut self) -> Result<()> {
        let mut prev: Option<&FieldId> = None;
        for field_id in self.dex.get_field_ids() {
            self.class_descriptor(field_id.class_idx, "field_id class")?;
            let type_desc = self.type_descriptor(field_id.type_idx, "field_id type")?;
            if type_desc == "V" {
                return dex_err!(BadDescriptor {
                    item_ty: "field_id type",
                    descriptor: type_desc
                });
            }
            let name = self.dex.get_utf16_str_at(field_id.name_idx)?;
            if !descriptors::is_valid_member_name(&name) {
                return dex_err!(BadMemberName, name);
            }

            if let Some(prev_id) = prev {
                let key = (field_id.class_idx, field_id.name_idx, field_id.type_idx);
                let prev_key = (prev_id.class_idx, prev_id.name_idx, prev_id.type_idx);
                if prev_key >= key {
                    return dex_err!(OutOfOrderIndex {
                        item_ty: "field_id",
                        prev: prev_id.name_idx,
                        current: field_id.name_idx
                    });
                }
            }
            prev = Some(field_id);
        }
        Ok(())
    }

    fn check_inter_method_ids(&mut self) -> Result<()> {
        let mut prev: Option<&MethodId> = None;
        for method_id in self.dex.get_method_ids() {
            self.class_descriptor(method_id.class_idx, "method_id class")?;
            self.check_index(
                method_id.proto_idx as u32,
                self.header().proto_ids_size,
                "method_id proto",
            )?;
            let name = self.dex.get_utf16_str_at(method_id.name_idx)?;
            if !descriptors::is_valid_member_name(&name) {
                return dex_err!(BadMemberName, name);
            }

            if let Some(prev_id) = prev {
                let key = (method_id.class_idx, method_id.name_idx, method_id.proto_idx);
                let prev_key = (prev_id.class_idx, prev_id.name_idx, prev_id.proto_idx);
                if prev_key >= key {
                    return dex_err!(OutOfOrderIndex {
                        item_ty: "method_id",
                        prev: prev_id.name_idx,
                        current: method_id.name_idx
                    });
                }
            }
            prev = Some(method_id);
        }
        Ok(())
    }

    fn check_inter_class_defs(&mut self) -> Result<()> {
        // first pass: positions of defined types, rejecting duplicates
        let mut defined_at: HashMap<TypeIndex, usize> = HashMap::new();
        for (i, class_def) in self.dex.get_class_defs().iter().enumerate() {
            self.check_index(
                class_def.class_idx as u32,
                self.header().type_ids_size,
                "class_def type",
            )?;
            if defined_at.insert(class_def.class_idx, i).is_some() {
                return dex_err!(DuplicateClassDef, class_def.class_idx);
            }
        }

        for (i, class_def) in self.dex.get_class_defs().iter().enumerate() {
            self.check_one_class_def(class_def, i, &defined_at)?;
            self.defined_classes.insert(class_def.class_idx);
        }
        Ok(())
    }

    fn check_one_class_def(
        &mut self,
        class_def: &'a ClassDef,
        def_pos: usize,
        defined_at: &HashMap<TypeIndex, usize>,
    ) -> Result<()> {
        let header = self.header();
        self.class_descriptor(class_def.class_idx, "class_def")?;

        let flags = class_def.access_flags;
        if flags & !CLASS_ACCESS_FLAGS != 0 {
            return dex_err!(BadAccessFlags {
                flags,
                item_ty: "class"
            });
        }
        if flags & ACC_INTERFACE != 0 && flags & ACC_ABSTRACT == 0 {
            return dex_err!(BadAccessFlags {
                flags,
                item_ty: "interface (must be abstract)"
            });
        }
        if flags & ACC_INTERFACE != 0 && flags & ACC_FINAL != 0 {
            return dex_err!(BadAccessFlags {
                flags,
                item_ty: "interface (must not be final)"
            });
        }

        if class_def.has_superclass() {
            if class_def.superclass_idx == class_def.class_idx {
                return dex_err!(
                    DexFileError,
                    "class with type idx {} lists itself as superclass",
                    class_def.class_idx
                );
            }
            self.class_descriptor(class_def.superclass_idx, "class_def superclass")?;
            // a superclass defined in the same file must come first
            if let Some(&super_pos) = defined_at.get(&class_def.superclass_idx) {
                if super_pos >= def_pos {
                    return dex_err!(ClassDefOrder {
                        class_idx: class_def.class_idx,
                        dep_idx: class_def.superclass_idx,
                        kind: "superclass"
                    });
                }
            }
        }

        if class_def.source_file_idx != NO_INDEX {
            self.check_index(
                class_def.source_file_idx,
                header.string_ids_size,
                "class_def source file",
            )?;
        }

        if class_def.interfaces_off != 0 {
            if self.offset_map.get(&class_def.interfaces_off) != Some(&MapItemType::TypeList) {
                return dex_err!(BadItemOffset {
                    offset: class_def.interfaces_off,
                    expected: "type_list"
                });
            }
            let mut seen: HashSet<TypeIndex> = HashSet::new();
            if let Some(interfaces) = self.dex.get_interfaces_list(class_def)? {
                for item in interfaces {
                    self.class_descriptor(item.type_idx, "class_def interface")?;
                    if !seen.insert(item.type_idx) {
                        return dex_err!(
                            DexFileError,
                            "class with type idx {} implements interface {} twice",
                            class_def.class_idx,
                            item.type_idx
                        );
                    }
                    if let Some(&iface_pos) = defined_at.get(&item.type_idx) {
                        if iface_pos >= def_pos {
                            return dex_err!(ClassDefOrder {
                                class_idx: class_def.class_idx,
                                dep_idx: item.type_idx,
                                kind: "interface"
                            });
                        }
                    }
                }
            }
        }

        if class_def.class_data_off != 0 {
            if self.offset_map.get(&class_def.class_data_off) != Some(&MapItemType::ClassDataItem) {
                return dex_err!(BadItemOffset {
                    offset: class_def.class_data_off,
                    expected: "class_data_item"
                });
            }
            self.check_class_data_ownership(class_def)?;
        }

        if class_def.static_values_off != 0
            && self.offset_map.get(&class_def.static_values_off)
                != Some(&MapItemType::EncodedArrayItem)
        {
            return dex_err!(BadItemOffset {
                offset: class_def.static_values_off,
                expected: "encoded_array_item"
            });
        }

        if class_def.annotations_off != 0 {
            if self.offset_map.get(&class_def.annotations_off)
                != Some(&MapItemType::AnnotationsDirectoryItem)
            {
                return dex_err!(BadItemOffset {
                    offset: class_def.annotations_off,
                    expected: "annotations_directory_item"
                });
            }
            self.check_annotations_directory_ownership(class_def)?;
        }
        Ok(())
    }

    /// Walks the class data and checks every member names this class as its
    /// defining class.
    fn check_class_data_ownership(&mut self, class_def: &ClassDef) -> Result<()> {
        let (fields, methods) = self.decode_class_data_members(class_def.class_data_off)?;
        for field_idx in fields {
            let field_id = self.dex.get_field_id(field_idx)?;
            if field_id.class_idx != class_def.class_idx {
                return dex_err!(
                    BadClassData,
                    "field {} is declared by class {} but listed under class {}",
                    field_idx,
                    field_id.class_idx,
                    class_def.class_idx
                );
            }
        }
        for method_idx in methods {
            let method_id = self.dex.get_method_id(method_idx)?;
            if method_id.class_idx != class_def.class_idx {
                return dex_err!(
                    BadClassData,
                    "method {} is declared by class {} but listed under class {}",
                    method_idx,
                    method_id.class_idx,
                    class_def.class_idx
                );
            }
        }
        Ok(())
    }

    /// Decodes the member indices of a (already intra-verified) class data
    /// item.
    fn decode_class_data_members(&self, class_data_off: u32) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut cursor = Cursor::new(
            self.data,
            class_data_off as usize,
            self.data.len(),
            "class_data_item",
        );
        let num_static_fields = cursor.uleb()?;
        let num_instance_fields = cursor.uleb()?;
        let num_direct_methods = cursor.uleb()?;
        let num_virtual_methods = cursor.uleb()?;

        let mut fields =
            Vec::with_capacity(num_static_fields as usize + num_instance_fields as usize);
        for count in [num_static_fields, num_instance_fields] {
            let mut index: u32 = 0;
            for _ in 0..count {
                index += cursor.uleb()?;
                cursor.uleb()?; // access flags
                fields.push(index);
            }
        }
        let mut methods =
            Vec::with_capacity(num_direct_methods as usize + num_virtual_methods as usize);
        for count in [num_direct_methods, num_virtual_methods] {
            let mut index: u32 = 0;
            for _ in 0..count {
                index += cursor.uleb()?;
                cursor.uleb()?; // access flags
                cursor.uleb()?; // code offset
                methods.push(index);
            }
        }
        Ok((fields, methods))
    }

    /// The class whose members an annotations directory may reference: the
    /// defining class of the first element of the class data. `None` when
    /// there is no class data or it is empty, in which case the directory
    /// must not carry member annotations at all.
    fn find_first_class_data_definer(&self, class_def: &ClassDef) -> Result<Option<TypeIndex>> {
        if class_def.class_data_off == 0 {
            return Ok(None);
        }
        let (fields, methods) = self.decode_class_data_members(class_def.class_data_off)?;
        if let Some(&field_idx) = fields.first() {
            return Ok(Some(self.dex.get_field_id(field_idx)?.class_idx));
        }
        if let Some(&method_idx) = methods.first() {
            return Ok(Some(self.dex.get_method_id(method_idx)?.class_idx));
        }
        Ok(None)
    }

    fn check_annotations_directory_ownership(&mut self, class_def: &'a ClassDef) -> Result<()> {
        let definer = self.find_first_class_data_definer(class_def)?;

        let accessor = self.dex.class_annotations(class_def)?;
        for field_annotation in accessor.get_field_annotations() {
            let field_id = self.dex.get_field_id(field_annotation.field_idx)?;
            if Some(field_id.class_idx) != definer {
                return dex_err!(AnnotationWrongDefiner {
                    member_idx: field_annotation.field_idx,
                    item_ty: "field",
                    definer
                });
            }
        }
        for method_annotation in accessor.get_method_annotations() {
            let method_id = self.dex.get_method_id(method_annotation.method_idx)?;
            if Some(method_id.class_idx) != definer {
                return dex_err!(AnnotationWrongDefiner {
                    member_idx: method_annotation.method_idx,
                    item_ty: "method",
                    definer
                });
            }
        }
        for parameter_annotation in accessor.get_parameter_annotations() {
            let method_id = self.dex.get_method_id(parameter_annotation.method_idx)?;
            if Some(method_id.class_idx) != definer {
                return dex_err!(AnnotationWrongDefiner {
                    member_idx: parameter_annotation.method_idx,
                    item_ty: "parameter",
                    definer
                });
            }
        }
        Ok(())
    }

    fn check_inter_call_sites(&mut self) -> Result<()> {
        for call_site in self.dex.get_call_site_ids() {
            if self.offset_map.get(&call_site.data_off) != Some(&MapItemType::EncodedArrayItem) {
                return dex_err!(BadItemOffset {
                    offset: call_site.data_off,
                    expected: "encoded_array_item"
                });
            }
        }
        Ok(())
    }

    fn check_inter_method_handles(&mut self) -> Result<()> {
        let header = self.header();
        for handle in self.dex.get_method_handles() {
            if handle.method_handle_type > method_handle_type::LAST {
                return dex_err!(
                    DexFileError,
                    "invalid method handle type {}",
                    handle.method_handle_type
                );
            }
            if method_handle_type::is_field_access(handle.method_handle_type) {
                self.check_index(
                    handle.field_or_method_idx as u32,
                    header.field_ids_size,
                    "method handle field",
                )?;
            } else {
                self.check_index(
                    handle.field_or_method_idx as u32,
                    header.method_ids_size,
                    "method handle method",
                )?;
            }
        }
        Ok(())
    }

    /// Annotation set entries must be sorted by the type index of the
    /// annotation they reference.
    fn check_inter_annotation_sets(&mut self) -> Result<()> {
        let sets: Vec<u32> = self
            .offset_map
            .iter()
            .filter(|(_, ty)| **ty == MapItemType::AnnotationSetItem)
            .map(|(off, _)| *off)
            .collect();
        for set_off in sets {
            let entries = self.dex.get_annotation_set(set_off)?;
            let mut prev: Option<u32> = None;
            for &annotation_off in entries {
                let mut cursor = Cursor::new(
                    self.data,
                    annotation_off as usize,
                    self.data.len(),
                    "annotation_item",
                );
                cursor.read_u8()?; // visibility
                let type_idx = cursor.uleb()?;
                if let Some(prev_idx) = prev {
                    if prev_idx >= type_idx {
                        return dex_err!(OutOfOrderIndex {
                            item_ty: "annotation set entry",
                            prev: prev_idx,
                            current: type_idx
                        });
                    }
                }
                prev = Some(type_idx);
            }
        }
        Ok(())
    }

    /// Type indices defined by this file, available after the inter pass.
    pub fn defined_classes(&self) -> &HashSet<TypeIndex> {
        &self.defined_classes
    }
}
