use memmap2::Mmap;
use plain::Plain;

pub mod structs;
pub use structs::*;
pub mod header;
pub use header::*;
pub mod annotations;
pub mod class_accessor;
pub mod verifier;
pub use class_accessor::*;
pub mod modifiers;
pub use modifiers::*;
pub mod code_item_accessors;
pub use code_item_accessors::*;
pub mod container;
pub use container::*;
pub mod debug;
pub mod lookup;
pub use lookup::TypeLookupTable;

#[cfg(test)]
pub(crate) mod testing;

use crate::{dex_err, leb128::decode_leb128, utf, Result};

use self::verifier::VerifyPreset;

pub const DEX_MAGIC: &[u8] = b"dex\n";
pub const DEX_MAGIC_VERSIONS: &[&[u8]] = &[
    b"035\0", b"037\0", // Dex version 038: Android "O" and beyond.
    b"038\0", // Dex version 039: Android "P" and beyond.
    b"039\0", // Dex version 040: Android "Q" and beyond (aka Android 10).
    b"040\0", // Dex version 041: Android "V" and beyond (aka Android 15).
    b"041\0",
];

pub const DEX_ENDIAN_CONSTANT: u32 = 0x12345678;
pub const DEX_BYTE_SWAPPED_ENDIAN_CONSTANT: u32 = 0x78563412;

#[derive(Debug, Clone)]
pub enum DexLocation {
    InMemory,
    Path(String),
}

impl From<&'static str> for DexLocation {
    fn from(s: &'static str) -> Self {
        DexLocation::Path(s.to_string())
    }
}

impl std::fmt::Display for DexLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DexLocation::InMemory => write!(f, "[in-memory]"),
            DexLocation::Path(path) => write!(f, "{}", path),
        }
    }
}

pub type InMemoryDexFile<'a> = DexFile<'a, InMemoryDexContainer<'a>>;
pub type MmapDexFile<'a> = DexFile<'a, Mmap>;

/// Read-only view of a dex file: the raw bytes plus typed accessors over the
/// id tables. Every index is dereferenced through a bounds-checked lookup;
/// nothing here reads past the container.
pub struct DexFile<'a, T: DexContainer<'a> = Mmap> {
    mmap: &'a T,
    header: &'a Header,

    string_ids: &'a [StringId],
    type_ids: &'a [TypeId],
    field_ids: &'a [FieldId],
    proto_ids: &'a [ProtoId],
    method_ids: &'a [MethodId],
    class_defs: &'a [ClassDef],
    method_handles: &'a [MethodHandleItem],
    call_site_ids: &'a [CallSiteIdItem],

    hiddenapi_data: Option<HiddenapiClassData<'a>>,

    location: DexLocation,
}

macro_rules! check_lt_result {
    ($idx:expr, $count:expr, $item_ty:tt) => {
        if ($idx as usize) >= ($count as usize) {
            return dex_err!(DexIndexError {
                index: $idx as u32,
                item_ty: stringify!($item_ty),
                max: $count as usize,
            });
        }
    };
}

pub(crate) use check_lt_result;

impl<'a, C: DexContainer<'a>> DexFile<'a, C> {
    #[inline]
    fn header_available(base: &'a C) -> bool {
        let size = base.len();
        size >= std::mem::size_of::<Header>() && plain::is_aligned::<Header>(base)
    }

    pub fn get_section<T: Plain>(base: &'a C, offset: u32, len: u32) -> &'a [T] {
        if len == 0 {
            return &[];
        }
        // sanity checks so that this function always returns a valid slice;
        // inconsistencies are reported by the verifier, not here
        let size = base.len();
        let Some(section_size) = (len as usize).checked_mul(std::mem::size_of::<T>()) else {
            return &[];
        };
        if offset as usize >= size || section_size > size - offset as usize {
            return &[];
        }

        let data = &base[offset as usize..];
        match T::slice_from_bytes_len(data, len as usize) {
            Ok(slice) => slice,
            Err(_) => &[],
        }
    }

    pub fn from_raw_parts(base: &'a C, location: DexLocation) -> Result<DexFile<'a, C>> {
        if !DexFile::header_available(base) {
            return dex_err!(TruncatedFile);
        }

        let header = match Header::from_bytes(base) {
            Ok(header) => header,
            Err(_) => return dex_err!(TruncatedFile),
        };
        let mut dex = Self {
            mmap: base,
            header,
            string_ids: DexFile::get_section(base, header.string_ids_off, header.string_ids_size),
            type_ids: DexFile::get_section(base, header.type_ids_off, header.type_ids_size),
            field_ids: DexFile::get_section(base, header.field_ids_off, header.field_ids_size),
            proto_ids: DexFile::get_section(base, header.proto_ids_off, header.proto_ids_size),
            method_ids: DexFile::get_section(base, header.method_ids_off, header.method_ids_size),
            class_defs: DexFile::get_section(base, header.class_defs_off, header.class_defs_size),
            method_handles: &[],
            call_site_ids: &[],
            hiddenapi_data: None,
            location,
        };

        dex.init_sections_from_maplist();
        Ok(dex)
    }

    /// Opens a dex file over any container, verifying with the given preset.
    pub fn open(base: &'a C, location: DexLocation, preset: VerifyPreset) -> Result<DexFile<'a, C>> {
        let dex = DexFile::from_raw_parts(base, location)?;
        dex.init()?;
        DexFile::verify(&dex, preset)?;
        Ok(dex)
    }

    pub fn open_container(container: &DexFileContainer) -> Result<MmapDexFile<'_>> {
        let loc = container.get_location();
        let size = container.data().len();
        if size < std::mem::size_of::<Header>() {
            return dex_err!(DexFileError, "Invalid or truncated file {:?}", loc);
        }

        DexFile::open(
            container.data(),
            DexLocation::Path(loc.to_string()),
            container.verify_preset(),
        )
    }

    pub fn expected_header_size(&self) -> u32 {
        let version = self.header.get_version();
        if version != 0 {
            if version < 41 {
                std::mem::size_of::<Header>() as u32
            } else {
                std::mem::size_of::<HeaderV41>() as u32
            }
        } else {
            0
        }
    }

    pub fn get_location(&self) -> &DexLocation {
        &self.location
    }

    #[inline(always)]
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    #[inline(always)]
    pub fn get_header(&self) -> &'a Header {
        self.header
    }

    #[inline(always)]
    pub fn get_hiddenapi_data(&self) -> Option<&HiddenapiClassData<'a>> {
        self.hiddenapi_data.as_ref()
    }

    /// The full byte range of the file.
    #[inline(always)]
    pub fn data(&self) -> &'a [u8] {
        &self.mmap[..]
    }

    // -- strings
    #[inline(always)]
    pub fn get_string_id(&self, idx: u32) -> Result<&'a StringId> {
        check_lt_result!(idx, self.num_string_ids(), StringId);
        Ok(&self.string_ids[idx as usize])
    }

    #[inline(always)]
    pub fn string_ids(&self) -> &'a [StringId] {
        self.string_ids
    }

    #[inline(always)]
    pub fn num_string_ids(&self) -> u32 {
        self.string_ids.len() as u32
    }

    /// Returns the declared UTF-16 length and the mUTF-8 bytes (including
    /// the trailing NUL) of the string data at `offset`.
    pub fn get_string_data_at(&self, offset: usize) -> Result<(u32, &'a [u8])> {
        check_lt_result!(offset, self.file_size(), "string-data");
        let (utf16_len, size) = match varint_simd::decode::<u32>(&self.mmap[offset..]) {
            Ok(pair) => pair,
            Err(e) => {
                return dex_err!(BadStringData { offset, kind: e });
            }
        };

        let start = offset + size;
        check_lt_result!(start, self.file_size(), "string-data");
        match &self.mmap[start..].iter().position(|x| *x == 0) {
            Some(pos) => Ok((utf16_len, &self.mmap[start..start + pos + 1])),
            None => dex_err!(BadStringDataMissingNullByte, start),
        }
    }

    #[inline]
    pub fn get_string_data(&self, string_id: &StringId) -> Result<(u32, &'a [u8])> {
        self.get_string_data_at(string_id.offset())
    }

    #[inline(always)]
    pub fn get_utf16_str_lossy(&self, string_id: &StringId) -> Result<String> {
        let (_, data) = self.get_string_data(string_id)?;
        Ok(utf::mutf8_to_str_lossy(data))
    }

    #[inline(always)]
    pub fn get_utf16_str_lossy_at(&self, idx: u32) -> Result<String> {
        let string_id = self.get_string_id(idx)?;
        self.get_utf16_str_lossy(string_id)
    }

    #[inline(always)]
    pub fn get_utf16_str(&self, string_id: &StringId) -> Result<String> {
        let (_, data) = self.get_string_data(string_id)?;
        crate::utf::mutf8_to_str(data)
    }

    #[inline(always)]
    pub fn get_utf16_str_at(&self, idx: u32) -> Result<String> {
        let string_id = self.get_string_id(idx)?;
        self.get_utf16_str(string_id)
    }

    // -- types
    #[inline(always)]
    pub fn get_type_id(&self, idx: TypeIndex) -> Result<&'a TypeId> {
        check_lt_result!(idx as u32, self.num_type_ids(), TypeId);
        Ok(&self.type_ids[idx as usize])
    }

    #[inline(always)]
    pub fn num_type_ids(&self) -> u32 {
        self.type_ids.len() as u32
    }

    #[inline(always)]
    pub fn get_type_ids(&self) -> &'a [TypeId] {
        self.type_ids
    }

    #[inline(always)]
    pub fn get_type_desc(&self, type_id: &TypeId) -> Result<String> {
        self.get_utf16_str_lossy_at(type_id.descriptor_idx)
    }

    #[inline(always)]
    pub fn get_type_desc_at(&self, idx: TypeIndex) -> Result<String> {
        self.get_type_desc(self.get_type_id(idx)?)
    }

    // -- code items
    #[inline(always)]
    pub fn get_code_item(&self, offset: u32) -> Result<Option<&'a CodeItem>> {
        check_lt_result!(offset, self.file_size(), "code item offset");
        self.data_ptr(offset)
    }

    #[inline(always)]
    pub fn get_code_item_accessor(&'a self, offset: u32) -> Result<CodeItemAccessor<'a>> {
        check_lt_result!(offset, self.file_size(), "code item offset");
        let code_item = self.non_null_data_ptr(offset)?;
        CodeItemAccessor::from_code_item(
            self,
            code_item,
            offset + std::mem::size_of::<CodeItem>() as u32,
        )
    }

    #[inline(always)]
    pub fn get_insns_raw(&self, code_off: u32, size_in_code_units: u32) -> Result<&'a [u16]> {
        check_lt_result!(code_off, self.file_size(), "code stream offset");
        self.non_null_array_data_ptr(code_off, size_in_code_units as usize)
    }

    // -- fields
    #[inline]
    pub fn get_field_id(&self, idx: u32) -> Result<&'a FieldId> {
        check_lt_result!(idx, self.field_ids.len(), FieldId);
        Ok(&self.field_ids[idx as usize])
    }

    #[inline(always)]
    pub fn num_field_ids(&self) -> u32 {
        self.field_ids.len() as u32
    }

    #[inline(always)]
    pub fn get_field_ids(&self) -> &'a [FieldId] {
        self.field_ids
    }

    pub fn get_field_name(&self, field_id: &FieldId) -> Result<String> {
        self.get_utf16_str_lossy_at(field_id.name_idx)
    }

    // -- protos
    pub fn get_proto_id(&self, idx: ProtoIndex) -> Result<&'a ProtoId> {
        check_lt_result!(idx, self.proto_ids.len(), ProtoId);
        Ok(&self.proto_ids[idx as usize])
    }

    #[inline(always)]
    pub fn num_proto_ids(&self) -> u32 {
        self.proto_ids.len() as u32
    }

    #[inline(always)]
    pub fn get_proto_ids(&self) -> &'a [ProtoId] {
        self.proto_ids
    }

    pub fn get_shorty(&self, proto_id: &ProtoId) -> Result<String> {
        self.get_utf16_str_at(proto_id.shorty_idx)
    }

    pub fn get_shorty_at(&self, idx: ProtoIndex) -> Result<String> {
        let proto_id = self.get_proto_id(idx)?;
        self.get_shorty(proto_id)
    }

    /// Builds the `(<params>)<ret>` signature string for a proto.
    pub fn get_proto_signature(&self, proto_id: &ProtoId) -> Result<String> {
        let mut signature = String::from("(");
        if let Some(params) = self.get_type_list(proto_id.parameters_off)? {
            for item in params {
                signature.push_str(&self.get_type_desc_at(item.type_idx)?);
            }
        }
        signature.push(')');
        signature.push_str(&self.get_type_desc_at(proto_id.return_type_idx)?);
        Ok(signature)
    }

    // -- methods
    #[inline(always)]
    pub fn get_method_id(&self, idx: u32) -> Result<&'a MethodId> {
        check_lt_result!(idx, self.method_ids.len(), MethodId);
        Ok(&self.method_ids[idx as usize])
    }

    #[inline(always)]
    pub fn num_method_ids(&self) -> u32 {
        self.method_ids.len() as u32
    }

    #[inline(always)]
    pub fn get_method_ids(&self) -> &'a [MethodId] {
        self.method_ids
    }

    pub fn get_method_name(&self, method_id: &MethodId) -> Result<String> {
        self.get_utf16_str_lossy_at(method_id.name_idx)
    }

    pub fn get_method_signature(&self, method_id: &MethodId) -> Result<String> {
        self.get_proto_signature(self.get_proto_id(method_id.proto_idx)?)
    }

    // -- method handles
    #[inline(always)]
    pub fn get_method_handle(&self, idx: u32) -> Result<&'a MethodHandleItem> {
        check_lt_result!(idx, self.method_handles.len(), MethodHandleItem);
        Ok(&self.method_handles[idx as usize])
    }

    #[inline(always)]
    pub fn num_method_handles(&self) -> u32 {
        self.method_handles.len() as u32
    }

    #[inline(always)]
    pub fn get_method_handles(&self) -> &'a [MethodHandleItem] {
        self.method_handles
    }

    // -- call sites
    #[inline(always)]
    pub fn get_call_site_id(&self, idx: u32) -> Result<&'a CallSiteIdItem> {
        check_lt_result!(idx, self.call_site_ids.len(), CallSiteIdItem);
        Ok(&self.call_site_ids[idx as usize])
    }

    #[inline(always)]
    pub fn num_call_site_ids(&self) -> u32 {
        self.call_site_ids.len() as u32
    }

    #[inline(always)]
    pub fn get_call_site_ids(&self) -> &'a [CallSiteIdItem] {
        self.call_site_ids
    }

    // -- tries
    #[inline]
    pub fn get_try_items_raw(&'a self, tries_off: u32, tries_size: u16) -> Result<&'a [TryItem]> {
        check_lt_result!(tries_off, self.file_size(), TryItem);
        self.non_null_array_data_ptr(tries_off, tries_size as usize)
    }

    // -- class defs
    #[inline(always)]
    pub fn get_class_def(&self, idx: u32) -> Result<&'a ClassDef> {
        check_lt_result!(idx, self.class_defs.len(), ClassDef);
        Ok(&self.class_defs[idx as usize])
    }

    #[inline(always)]
    pub fn num_class_defs(&self) -> u32 {
        self.class_defs.len() as u32
    }

    #[inline(always)]
    pub fn get_class_defs(&self) -> &'a [ClassDef] {
        self.class_defs
    }

    #[inline]
    pub fn get_class_desc(&self, class_def: &ClassDef) -> Result<String> {
        self.get_type_desc_at(class_def.class_idx)
    }

    #[inline]
    pub fn get_interfaces_list(&self, class_def: &ClassDef) -> Result<Option<TypeList<'a>>> {
        self.get_type_list(class_def.interfaces_off)
    }

    // -- type lists
    #[inline(always)]
    pub fn get_type_list(&self, offset: u32) -> Result<Option<TypeList<'a>>> {
        if offset == 0 {
            return Ok(None);
        }

        check_lt_result!(offset, self.file_size(), TypeList);
        let length: &u32 = self.non_null_data_ptr(offset)?;
        let data_off = offset + std::mem::size_of::<u32>() as u32;

        self.array_data_ptr(data_off, *length as usize)
    }

    // -- typed pointer helpers shared with the accessor/verifier modules
    #[inline]
    pub(crate) fn data_ptr<T: Plain>(&self, offset: u32) -> Result<Option<&'a T>> {
        match offset {
            0 => Ok(None),
            _ => Ok(Some(self.non_null_data_ptr(offset)?)),
        }
    }

    #[inline]
    pub(crate) fn non_null_data_ptr<T: Plain>(&self, offset: u32) -> Result<&'a T> {
        if offset == 0 || offset as usize >= self.file_size() {
            return dex_err!(DexLayoutError, self, offset, std::any::type_name::<T>(), 0);
        }
        match T::from_bytes(&self.mmap[offset as usize..]) {
            Ok(v) => Ok(v),
            Err(_) => {
                dex_err!(DexLayoutError, self, offset, std::any::type_name::<T>(), 0)
            }
        }
    }

    #[inline]
    pub(crate) fn array_data_ptr<T: Plain>(&self, offset: u32, len: usize) -> Result<Option<&'a [T]>> {
        match offset {
            0 => Ok(None),
            _ => Ok(Some(self.non_null_array_data_ptr(offset, len)?)),
        }
    }

    #[inline]
    pub(crate) fn non_null_array_data_ptr<T: Plain>(&self, offset: u32, len: usize) -> Result<&'a [T]> {
        if offset == 0 || offset as usize > self.file_size() {
            return dex_err!(DexLayoutError, self, offset, std::any::type_name::<T>(), len);
        }
        match T::slice_from_bytes_len(&self.mmap[offset as usize..], len) {
            Ok(v) => Ok(v),
            Err(_) => dex_err!(DexLayoutError, self, offset, std::any::type_name::<T>(), len),
        }
    }

    fn init(&self) -> Result<()> {
        let container_size = self.file_size();
        if container_size < std::mem::size_of::<Header>() {
            return dex_err!(
                DexFileError,
                "Unable to open {:?}: File size is too small to fit dex header",
                self.location
            );
        }

        self.check_magic_and_version()?;

        let expected_header_size = self.expected_header_size();
        if expected_header_size < self.header.header_size {
            return dex_err!(
                DexFileError,
                "Unable to open {:?}: Header size is {} but {} was expected",
                self.location,
                self.header.header_size,
                expected_header_size
            );
        }

        if container_size < self.header.file_size as usize {
            return dex_err!(
                DexFileError,
                "Unable to open {:?}: File size is {} but the header expects {}",
                self.location,
                container_size,
                self.header.file_size
            );
        }
        Ok(())
    }

    fn check_magic_and_version(&self) -> Result<()> {
        if !self.is_magic_valid() {
            return dex_err!(
                DexFileError,
                "Unrecognized magic number in {:?}: {:?}",
                self.location,
                &self.header.get_magic()[..4]
            );
        }

        if !self.is_version_valid() {
            return dex_err!(
                DexFileError,
                "Unrecognized dex version in {:?}: {:?}",
                self.location,
                &self.header.get_magic()[4..]
            );
        }
        Ok(())
    }

    #[inline]
    fn maplist_available(&self) -> bool {
        if self.header.map_off == 0x00 {
            return false;
        }

        let size = self.file_size();
        let end = self.header.map_off as usize + std::mem::size_of::<u32>();
        end <= size && self.header.map_off % 4 == 0
    }

    fn init_sections_from_maplist(&mut self) {
        if !self.maplist_available() {
            // bad offset; reported through the verifier
            return;
        }

        let map_list_size_off = self.header.map_off;
        let map_list_off = self.header.map_off as usize + std::mem::size_of::<u32>();
        if map_list_off >= self.file_size() {
            return;
        }

        let count: &u32 = match self.non_null_data_ptr(map_list_size_off) {
            Ok(v) => v,
            Err(_) => return,
        };
        let map_limit = (self.file_size() - map_list_off) / std::mem::size_of::<MapItem>();

        if *count as usize > map_limit {
            // bad file
            return;
        }

        let items =
            match self.non_null_array_data_ptr::<MapItem>(map_list_off as u32, *count as usize) {
                Ok(v) => v,
                Err(_) => return,
            };
        for map_item in items {
            match map_item.map_type() {
                Some(MapItemType::MethodHandleItem) => {
                    self.method_handles =
                        DexFile::get_section(self.mmap, map_item.off, map_item.size)
                }
                Some(MapItemType::CallSiteIdItem) => {
                    self.call_site_ids =
                        DexFile::get_section(self.mmap, map_item.off, map_item.size)
                }
                Some(MapItemType::HiddenapiClassData) => {
                    let item_off = map_item.off as usize;
                    let item_end = item_off.saturating_add(map_item.size as usize);
                    if item_end <= self.file_size() {
                        self.hiddenapi_data =
                            HiddenapiClassData::parse(&self.mmap[item_off..item_end]);
                    }
                }
                _ => {}
            }
        }
    }
}
