use std::fmt::Debug;

use thiserror::Error;

#[derive(Error)]
pub enum DexError {
    #[error("Empty or truncated file")]
    TruncatedFile,

    #[error("Bad file magic")]
    BadFileMagic,

    #[error("Unknown dex version: {version}")]
    UnknownDexVersion { version: u32 },

    #[error("Bad file size ({actual}, expected at least {expected})")]
    FileSizeAtLeast { actual: usize, expected: usize },

    #[error("Bad file size ({actual}, expected at most {expected})")]
    FileSizeAtMost { actual: usize, expected: usize },

    #[error("Bad header size: {size}, expected {expected}")]
    BadHeaderSize { size: u32, expected: u32 },

    #[error("Unexpected endian tag: {0:#x}")]
    UnexpectedEndianess(u32),

    #[error("Bad checksum: {actual:#010x}, expected {expected:#010x}")]
    BadChecksum { actual: u32, expected: u32 },

    #[error("Offset({offset}) should be within file size {size} for {section}")]
    BadOffsetTooLarge {
        offset: u32,
        size: usize,
        section: &'static str,
    },

    #[error("Offset({offset}) should be after header({header_size}) for {section}")]
    BadOffsetInHeader {
        offset: u32,
        header_size: usize,
        section: &'static str,
    },

    #[error("Offset({offset}) should be zero when size is zero for {section}")]
    BadOffsetNoSize { offset: u32, section: &'static str },

    #[error("Section end({offset}) should be within file size {size} for {section}")]
    BadSection {
        offset: u32,
        size: usize,
        section: &'static str,
    },

    #[error("Offset({offset}) is not aligned to {alignment} for {section}")]
    BadAlignment {
        offset: u32,
        alignment: u32,
        section: &'static str,
    },

    #[error("Size overflow computing {count} * {element_size} for {section}")]
    ListSizeOverflow {
        count: u32,
        element_size: usize,
        section: &'static str,
    },

    #[error("{0}")]
    DexFileError(String),

    #[error("Index({index}) to {item_ty} should be less than {max}")]
    DexIndexError {
        index: u32,
        max: usize,
        item_ty: &'static str,
    },

    #[error("Bad string data({0}) does not end with a null byte!")]
    BadStringDataMissingNullByte(usize),

    #[error("{0}")]
    Mutf8DecodeError(#[from] std::string::FromUtf16Error),

    #[error("Failed to read {location}: {item_ty} at offset {offset} (array_len={array_len}) overflows with file size({file_size})")]
    DexLayoutError {
        location: String,
        offset: u32,
        item_ty: &'static str,
        array_len: usize,
        file_size: usize,
    },

    #[error("Failed to parse varint: {0}")]
    VarIntError(#[from] varint_simd::VarIntDecodeError),

    #[error("Bad string data({offset}) contains invalid LEB128({kind:?}) which can't be converted to a valid u32")]
    BadStringData {
        offset: usize,
        #[source]
        kind: varint_simd::VarIntDecodeError,
    },

    #[error("Truncated LEB128 at offset {offset} for {item_ty}")]
    TruncatedLeb128 {
        offset: usize,
        item_ty: &'static str,
    },

    #[error("Invalid mUTF-8 byte {byte:#04x} at offset {offset}")]
    BadMutf8Byte { byte: u8, offset: usize },

    #[error("mUTF-8 length mismatch at offset {offset}: declared {declared} UTF-16 units, decoded {actual}")]
    Mutf8LengthMismatch {
        offset: usize,
        declared: u32,
        actual: u32,
    },

    #[error("Encountered invalid encoded index that would overflow: index({index}) + next index({next_index}) > u32::MAX for {item_ty}")]
    BadEncodedIndex {
        index: u32,
        next_index: u32,
        item_ty: &'static str,
    },

    #[error("Out-of-order {item_ty} indexes: {prev} then {current}")]
    OutOfOrderIndex {
        item_ty: &'static str,
        prev: u32,
        current: u32,
    },

    #[error("Duplicate map section of type {type_code:#06x}")]
    DuplicateMapSection { type_code: u16 },

    #[error("Unknown map section type {type_code:#06x} at offset {offset}")]
    UnknownMapSectionType { type_code: u16, offset: u32 },

    #[error("Missing mandatory map section of type {type_code:#06x}")]
    MissingMapSection { type_code: u16 },

    #[error("Map section of type {type_code:#06x} disagrees with header: map has size {map_size} @ {map_off}, header has {header_size} @ {header_off}")]
    MapSectionMismatch {
        type_code: u16,
        map_size: u32,
        map_off: u32,
        header_size: u32,
        header_off: u32,
    },

    #[error("Out-of-order map item for type {type_code:#06x}: offset {offset} is not after {prev_offset}")]
    OutOfOrderMapItem {
        type_code: u16,
        offset: u32,
        prev_offset: u32,
    },

    #[error("Offset({offset}) does not point to a verified {expected} item")]
    BadItemOffset { offset: u32, expected: &'static str },

    #[error("Invalid encoded value type {value_type:#04x} at offset {offset}")]
    BadEncodedValueType { value_type: u8, offset: usize },

    #[error("Invalid encoded value arg {value_arg} for value type {value_type:#04x}")]
    BadEncodedValueArg { value_type: u8, value_arg: u8 },

    #[error("Invalid visibility {0:#04x} for annotation item")]
    BadAnnotationVisibility(u8),

    #[error("Invalid debug info opcode sequence: {0}")]
    BadDebugInfo(String),

    #[error("Invalid descriptor for {item_ty}: {descriptor:?}")]
    BadDescriptor {
        item_ty: &'static str,
        descriptor: String,
    },

    #[error("Invalid member name: {0:?}")]
    BadMemberName(String),

    #[error("Shorty {shorty:?} does not match descriptor {descriptor:?} at position {pos}")]
    ShortyMismatch {
        shorty: String,
        descriptor: String,
        pos: usize,
    },

    #[error("Duplicate class definition for type index {0}")]
    DuplicateClassDef(u16),

    #[error("Invalid class definition ordering: class with type idx {class_idx} defined before {kind} with type idx {dep_idx}")]
    ClassDefOrder {
        class_idx: u16,
        dep_idx: u16,
        kind: &'static str,
    },

    #[error("Invalid access flags {flags:#x} for {item_ty}")]
    BadAccessFlags { flags: u32, item_ty: &'static str },

    #[error("Bad code item: {0}")]
    BadCodeItem(String),

    #[error("Bad class data item: {0}")]
    BadClassData(String),

    #[error("Member {member_idx} of {item_ty} annotation is not defined by class with type idx {definer:?}")]
    AnnotationWrongDefiner {
        member_idx: u32,
        item_ty: &'static str,
        definer: Option<u16>,
    },

    #[error("Unsupported class-def count {0} for type lookup table")]
    UnsupportedLookupTableSize(u32),
}

#[macro_export]
macro_rules! dex_err {
    ($name:ident) => {
        Err($crate::error::DexError::$name)
    };
    ($name:ident, $arg1:literal, $($arg:tt)*) => {
        Err($crate::error::DexError::$name(format!($arg1, $($arg)*)))
    };
    (DexLayoutError, $dex:ident, $off:ident, $item_ty:expr, $array_len:expr) => {
        Err($crate::error::DexError::DexLayoutError {
            location: $dex.get_location().to_string(),
            offset: $off,
            item_ty: $item_ty,
            array_len: $array_len,
            file_size: $dex.file_size(),
        })
    };
    ($name:ident { $($arg:tt)* }) => {
        Err($crate::error::DexError::$name { $($arg)* })
    };
    ($name:ident, $($arg:tt)*) => {
        Err($crate::error::DexError::$name($($arg)*))
    };
}

impl Debug for DexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Link-time failures. Each variant corresponds to the Java-level error that
/// a class which failed linking throws on use.
#[derive(Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("NoClassDefFoundError: {0}")]
    NoClassDefFound(String),

    #[error("IncompatibleClassChangeError: {0}")]
    IncompatibleClassChange(String),

    #[error("AbstractMethodError: {0}")]
    AbstractMethod(String),

    #[error("ClassFormatError: {0}")]
    ClassFormat(String),

    #[error("VerifyError: {0}")]
    VerifyError(String),

    #[error("ClassCircularityError: {0}")]
    ClassCircularity(String),
}

#[macro_export]
macro_rules! link_err {
    ($name:ident, $arg1:literal) => {
        Err($crate::error::LinkError::$name($arg1.to_string()))
    };
    ($name:ident, $arg1:literal, $($arg:tt)*) => {
        Err($crate::error::LinkError::$name(format!($arg1, $($arg)*)))
    };
}

impl Debug for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
