use plain::Plain;

pub type StringIndex = u32;

/// "no index" sentinel for 32-bit index fields (e.g. `source_file_idx`).
pub const NO_INDEX: u32 = 0xffff_ffff;

/// "no index" sentinel for 16-bit type indices (e.g. `superclass_idx`).
pub const NO_INDEX16: u16 = 0xffff;

#[repr(C)]
#[derive(Debug, Clone)]
pub struct StringId {
    pub string_data_off: u32,
}

unsafe impl plain::Plain for StringId {}

impl StringId {
    #[inline]
    pub const fn offset(&self) -> usize {
        self.string_data_off as usize
    }
}

pub type TypeIndex = u16;

#[repr(C)]
#[derive(Debug, Clone)]
pub struct TypeId {
    pub descriptor_idx: StringIndex,
}

unsafe impl plain::Plain for TypeId {}

pub type FieldIndex = u32;

#[repr(C)]
#[derive(Debug, Clone)]
pub struct FieldId {
    pub class_idx: TypeIndex,  // index into type_ids_ array for defining class
    pub type_idx: TypeIndex,   // index into type_ids_ array for field type
    pub name_idx: StringIndex, // index into string_ids_ array for field name
}

unsafe impl plain::Plain for FieldId {}

pub type ProtoIndex = u16;

#[repr(C)]
#[derive(Debug, Clone)]
pub struct ProtoId {
    pub shorty_idx: StringIndex, // index into string_ids array for shorty descriptor
    pub return_type_idx: TypeIndex, // index into type_ids array for return type
    pad_: u16,                   // padding = 0
    pub parameters_off: u32,     // file offset to type_list for parameter types
}

unsafe impl plain::Plain for ProtoId {}

#[repr(C)]
#[derive(Debug, Clone)]
pub struct MethodId {
    pub class_idx: TypeIndex,  // index into type_ids_ array for defining class
    pub proto_idx: ProtoIndex, // index into proto_ids_ array for method signature
    pub name_idx: StringIndex, // index into string_ids_ array for method name
}

unsafe impl plain::Plain for MethodId {}

#[repr(C)]
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub class_idx: TypeIndex, // index into type_ids_ array for this class
    pad1_: u16,               // padding = 0
    pub access_flags: u32,
    pub superclass_idx: TypeIndex, // index into type_ids_ array for superclass
    pad2_: u16,                    // padding = 0 (0xffff when superclass_idx is NO_INDEX16)
    pub interfaces_off: u32,       // file offset to TypeList
    pub source_file_idx: StringIndex, // index into string_ids_ for source file name
    pub annotations_off: u32,      // file offset to annotations_directory_item
    pub class_data_off: u32,       // file offset to class_data_item
    pub static_values_off: u32,    // file offset to EncodedArray
}

unsafe impl plain::Plain for ClassDef {}

impl ClassDef {
    #[inline]
    pub fn has_superclass(&self) -> bool {
        self.superclass_idx != NO_INDEX16
    }
}

#[repr(C)]
#[derive(Debug, Clone)]
pub struct TypeItem {
    pub type_idx: TypeIndex, // index into type_ids section
}

unsafe impl plain::Plain for TypeItem {}

pub type TypeList<'a> = &'a [TypeItem];

/// Raw map-list entry. The type code is kept as a plain `u16` so that
/// unknown codes surface as verification errors instead of undefined enum
/// values.
#[repr(C)]
#[derive(Debug)]
pub struct MapItem {
    pub type_code: u16,
    unused_: u16,
    pub size: u32,
    pub off: u32,
}

unsafe impl plain::Plain for MapItem {}

impl MapItem {
    #[inline]
    pub fn map_type(&self) -> Option<MapItemType> {
        MapItemType::from_code(self.type_code)
    }
}

pub type MapList<'a> = &'a [MapItem];

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapItemType {
    HeaderItem = 0x0000,
    StringIdItem = 0x0001,
    TypeIdItem = 0x0002,
    ProtoIdItem = 0x0003,
    FieldIdItem = 0x0004,
    MethodIdItem = 0x0005,
    ClassDefItem = 0x0006,
    CallSiteIdItem = 0x0007,
    MethodHandleItem = 0x0008,
    MapList = 0x1000,
    TypeList = 0x1001,
    AnnotationSetRefList = 0x1002,
    AnnotationSetItem = 0x1003,
    ClassDataItem = 0x2000,
    CodeItem = 0x2001,
    StringDataItem = 0x2002,
    DebugInfoItem = 0x2003,
    AnnotationItem = 0x2004,
    EncodedArrayItem = 0x2005,
    AnnotationsDirectoryItem = 0x2006,
    HiddenapiClassData = 0xf000,
}

impl MapItemType {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0000 => Self::HeaderItem,
            0x0001 => Self::StringIdItem,
            0x0002 => Self::TypeIdItem,
            0x0003 => Self::ProtoIdItem,
            0x0004 => Self::FieldIdItem,
            0x0005 => Self::MethodIdItem,
            0x0006 => Self::ClassDefItem,
            0x0007 => Self::CallSiteIdItem,
            0x0008 => Self::MethodHandleItem,
            0x1000 => Self::MapList,
            0x1001 => Self::TypeList,
            0x1002 => Self::AnnotationSetRefList,
            0x1003 => Self::AnnotationSetItem,
            0x2000 => Self::ClassDataItem,
            0x2001 => Self::CodeItem,
            0x2002 => Self::StringDataItem,
            0x2003 => Self::DebugInfoItem,
            0x2004 => Self::AnnotationItem,
            0x2005 => Self::EncodedArrayItem,
            0x2006 => Self::AnnotationsDirectoryItem,
            0xf000 => Self::HiddenapiClassData,
            _ => return None,
        })
    }

    /// Natural alignment of items in a section of this type.
    pub fn alignment(self) -> u32 {
        match self {
            Self::ClassDataItem
            | Self::StringDataItem
            | Self::DebugInfoItem
            | Self::AnnotationItem
            | Self::EncodedArrayItem => 1,
            _ => 4,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct MethodHandleItem {
    pub method_handle_type: u16,
    reserved1_: u16,
    pub field_or_method_idx: u16, // Field index for accessors, method index otherwise.
    reserved2_: u16,
}

unsafe impl plain::Plain for MethodHandleItem {}

/// method_handle_type values.
pub mod method_handle_type {
    pub const STATIC_PUT: u16 = 0x00;
    pub const STATIC_GET: u16 = 0x01;
    pub const INSTANCE_PUT: u16 = 0x02;
    pub const INSTANCE_GET: u16 = 0x03;
    pub const INVOKE_STATIC: u16 = 0x04;
    pub const INVOKE_INSTANCE: u16 = 0x05;
    pub const INVOKE_CONSTRUCTOR: u16 = 0x06;
    pub const INVOKE_DIRECT: u16 = 0x07;
    pub const INVOKE_INTERFACE: u16 = 0x08;

    pub const LAST: u16 = INVOKE_INTERFACE;

    pub fn is_field_access(ty: u16) -> bool {
        ty <= INSTANCE_GET
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct CallSiteIdItem {
    pub data_off: u32, // Offset into data section pointing to encoded array items.
}

unsafe impl plain::Plain for CallSiteIdItem {}

/// View over a `hiddenapi_class_data` section: a size word followed by
/// per-class flag offsets.
#[derive(Debug, Clone)]
pub struct HiddenapiClassData<'a> {
    pub size: u32,
    flags_offset: &'a [u8],
}

impl<'a> HiddenapiClassData<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let size = u32::from_bytes(bytes).ok()?;
        if *size as usize > bytes.len() {
            return None;
        }
        Some(Self {
            size: *size,
            flags_offset: &bytes[4..],
        })
    }

    pub fn get_flags_slice(&self, class_def_idx: u32) -> Option<&'a [u8]> {
        let offset = (class_def_idx as usize).checked_mul(4)?;
        match u32::from_bytes(self.flags_offset.get(offset..)?) {
            Ok(0) => None,
            // offset is relative to the beginning of the section
            Ok(start) => self.flags_offset.get((*start as usize).checked_sub(4)?..),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub tries_size: u16,
    pub debug_info_off: u32,
    pub insns_size: u32, // in 16-bit code units
}

unsafe impl plain::Plain for CodeItem {}

#[repr(C)]
#[derive(Debug)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    pub handler_off: u16,
}

unsafe impl plain::Plain for TryItem {}

#[repr(C)]
#[derive(Debug)]
pub struct AnnotationsDirectoryItem {
    pub class_annotations_off: u32,
    pub fields_size: u32,
    pub methods_size: u32,
    pub parameters_size: u32,
}

unsafe impl plain::Plain for AnnotationsDirectoryItem {}

#[repr(C)]
#[derive(Debug)]
pub struct FieldAnnotationsItem {
    pub field_idx: u32,
    pub annotations_off: u32,
}

unsafe impl plain::Plain for FieldAnnotationsItem {}

#[repr(C)]
#[derive(Debug)]
pub struct MethodAnnotationsItem {
    pub method_idx: u32,
    pub annotations_off: u32,
}

unsafe impl plain::Plain for MethodAnnotationsItem {}

#[repr(C)]
#[derive(Debug)]
pub struct ParameterAnnotationsItem {
    pub method_idx: u32,
    pub annotations_off: u32,
}

unsafe impl plain::Plain for ParameterAnnotationsItem {}

pub type AnnotationSetItem<'a> = &'a [u32];

/// encoded_value type tags (low five bits of the leading byte).
pub mod value_type {
    pub const BYTE: u8 = 0x00;
    pub const SHORT: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const INT: u8 = 0x04;
    pub const LONG: u8 = 0x06;
    pub const FLOAT: u8 = 0x10;
    pub const DOUBLE: u8 = 0x11;
    pub const METHOD_TYPE: u8 = 0x15;
    pub const METHOD_HANDLE: u8 = 0x16;
    pub const STRING: u8 = 0x17;
    pub const TYPE: u8 = 0x18;
    pub const FIELD: u8 = 0x19;
    pub const METHOD: u8 = 0x1a;
    pub const ENUM: u8 = 0x1b;
    pub const ARRAY: u8 = 0x1c;
    pub const ANNOTATION: u8 = 0x1d;
    pub const NULL: u8 = 0x1e;
    pub const BOOLEAN: u8 = 0x1f;
}

/// annotation_item visibility values.
pub mod visibility {
    pub const BUILD: u8 = 0x00;
    pub const RUNTIME: u8 = 0x01;
    pub const SYSTEM: u8 = 0x02;
}

pub type EncodedArray = Vec<EncodedValue>;

#[derive(Debug)]
pub enum EncodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    MethodType(u32),
    MethodHandle(u32),
    String(u32),
    Type(u32),
    Field(u32),
    Method(u32),
    Enum(u32),
    Array(EncodedArray),
    Annotation(EncodedAnnotation),
    Null,
    True,
    False,
}

#[derive(Debug)]
pub struct AnnotationElement {
    pub name_idx: u32,
    pub value: EncodedValue,
}

#[derive(Debug)]
pub struct EncodedAnnotation {
    pub type_idx: u32,
    pub elements: Vec<AnnotationElement>,
}

#[derive(Debug)]
pub struct AnnotationItem {
    pub visibility: u8,
    pub annotation: EncodedAnnotation,
}

#[derive(Debug, Default, Clone)]
pub struct CatchHandlerData {
    pub type_idx: TypeIndex,
    pub address: u32,
    pub is_catch_all: bool,
}
