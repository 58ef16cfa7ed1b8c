//! Synthetic dex files for tests: a small builder that lays out a valid
//! file (header, id tables, class data, code, string data, map list) so
//! individual fields can then be corrupted byte-wise.

use std::collections::{BTreeSet, HashMap};

use crate::utf;

use super::{ACC_ABSTRACT, ACC_PUBLIC, NO_INDEX, NO_INDEX16};

/// Byte offsets of header fields, for targeted corruption.
#[rustfmt::skip]
pub mod header_offset {
    pub const CHECKSUM: usize        = 8;
    pub const FILE_SIZE: usize       = 32;
    pub const HEADER_SIZE: usize     = 36;
    pub const ENDIAN_TAG: usize      = 40;
    pub const MAP_OFF: usize         = 52;
    pub const STRING_IDS_SIZE: usize = 56;
    pub const STRING_IDS_OFF: usize  = 60;
    pub const TYPE_IDS_SIZE: usize   = 64;
    pub const TYPE_IDS_OFF: usize    = 68;
    pub const PROTO_IDS_SIZE: usize  = 72;
    pub const PROTO_IDS_OFF: usize   = 76;
    pub const FIELD_IDS_SIZE: usize  = 80;
    pub const FIELD_IDS_OFF: usize   = 84;
    pub const METHOD_IDS_SIZE: usize = 88;
    pub const METHOD_IDS_OFF: usize  = 92;
    pub const CLASS_DEFS_SIZE: usize = 96;
    pub const CLASS_DEFS_OFF: usize  = 100;
    pub const DATA_SIZE: usize       = 104;
    pub const DATA_OFF: usize        = 108;
}

pub fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Recomputes the Adler32 checksum after a corruption, so tests reach the
/// check they aim at instead of failing on the checksum.
pub fn fix_checksum(bytes: &mut [u8]) {
    let checksum = adler32::adler32(&bytes[12..]).unwrap();
    put_u32(bytes, header_offset::CHECKSUM, checksum);
}

#[derive(Clone)]
pub struct TestMethod {
    pub name: String,
    pub is_abstract: bool,
}

impl TestMethod {
    pub fn concrete(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_abstract: false,
        }
    }

    pub fn abstract_(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_abstract: true,
        }
    }
}

#[derive(Clone)]
pub struct TestClass {
    pub descriptor: String,
    pub superclass: Option<String>,
    pub access_flags: u32,
    pub virtual_methods: Vec<TestMethod>,
}

impl TestClass {
    pub fn empty(descriptor: &str) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            superclass: None,
            access_flags: ACC_PUBLIC,
            virtual_methods: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct DexBuilder {
    classes: Vec<TestClass>,
}

const HEADER_SIZE: usize = 0x70;
const CODE_ITEM_STRIDE: usize = 20; // 16 byte header + one code unit + pad

fn encode_uleb(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

impl DexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_empty_classes(descriptors: &[&str]) -> Self {
        Self {
            classes: descriptors.iter().map(|d| TestClass::empty(d)).collect(),
        }
    }

    pub fn add_class(mut self, class: TestClass) -> Self {
        self.classes.push(class);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let has_methods = self.classes.iter().any(|c| !c.virtual_methods.is_empty());

        // ---- string and type tables (sorted; ASCII sorts the same in
        // byte order and UTF-16 code point order)
        let mut type_set: BTreeSet<String> = BTreeSet::new();
        let mut string_set: BTreeSet<String> = BTreeSet::new();
        for class in &self.classes {
            type_set.insert(class.descriptor.clone());
            string_set.insert(class.descriptor.clone());
            if let Some(superclass) = &class.superclass {
                type_set.insert(superclass.clone());
                string_set.insert(superclass.clone());
            }
            for method in &class.virtual_methods {
                string_set.insert(method.name.clone());
            }
        }
        if has_methods {
            type_set.insert("V".to_string());
            string_set.insert("V".to_string());
        }

        let string_list: Vec<String> = string_set.into_iter().collect();
        let string_index: HashMap<&str, u32> = string_list
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i as u32))
            .collect();
        // type ids must be sorted by descriptor string index; the string
        // list is sorted, so filtering it preserves the required order
        let type_list: Vec<&str> = string_list
            .iter()
            .map(|s| s.as_str())
            .filter(|s| type_set.contains(*s))
            .collect();
        let type_index: HashMap<&str, u16> = type_list
            .iter()
            .enumerate()
            .map(|(i, s)| (*s, i as u16))
            .collect();

        // ---- method id table, sorted by (class, name, proto)
        let mut method_keys: BTreeSet<(u16, u32)> = BTreeSet::new();
        for class in &self.classes {
            let class_idx = type_index[class.descriptor.as_str()];
            for method in &class.virtual_methods {
                method_keys.insert((class_idx, string_index[method.name.as_str()]));
            }
        }
        let method_list: Vec<(u16, u32)> = method_keys.into_iter().collect();
        let method_index: HashMap<(u16, u32), u32> = method_list
            .iter()
            .enumerate()
            .map(|(i, key)| (*key, i as u32))
            .collect();

        let num_strings = string_list.len();
        let num_types = type_list.len();
        let num_protos = usize::from(has_methods);
        let num_methods = method_list.len();
        let num_classes = self.classes.len();

        // ---- layout
        let string_ids_off = HEADER_SIZE;
        let type_ids_off = string_ids_off + 4 * num_strings;
        let proto_ids_off = type_ids_off + 4 * num_types;
        let method_ids_off = proto_ids_off + 12 * num_protos;
        let class_defs_off = method_ids_off + 8 * num_methods;
        let data_off = class_defs_off + 32 * num_classes;

        // code items, one per concrete method
        let mut code_offsets: HashMap<(usize, usize), u32> = HashMap::new();
        let mut pos = data_off;
        let mut num_code_items = 0usize;
        let code_off_base = pos;
        for (ci, class) in self.classes.iter().enumerate() {
            for (mi, method) in class.virtual_methods.iter().enumerate() {
                if !method.is_abstract {
                    code_offsets.insert((ci, mi), pos as u32);
                    pos += CODE_ITEM_STRIDE;
                    num_code_items += 1;
                }
            }
        }

        // class data items
        let mut class_data: Vec<Option<Vec<u8>>> = Vec::with_capacity(num_classes);
        let mut class_data_offsets: Vec<u32> = Vec::with_capacity(num_classes);
        let class_data_base = pos;
        for (ci, class) in self.classes.iter().enumerate() {
            if class.virtual_methods.is_empty() {
                class_data.push(None);
                class_data_offsets.push(0);
                continue;
            }
            let class_idx = type_index[class.descriptor.as_str()];
            // virtual method records sorted by ascending method id
            let mut records: Vec<(u32, usize)> = class
                .virtual_methods
                .iter()
                .enumerate()
                .map(|(mi, m)| {
                    (
                        method_index[&(class_idx, string_index[m.name.as_str()])],
                        mi,
                    )
                })
                .collect();
            records.sort_unstable();

            let mut encoded = Vec::new();
            encode_uleb(&mut encoded, 0); // static fields
            encode_uleb(&mut encoded, 0); // instance fields
            encode_uleb(&mut encoded, 0); // direct methods
            encode_uleb(&mut encoded, records.len() as u32);
            let mut prev = 0u32;
            for (k, (method_id, mi)) in records.iter().enumerate() {
                let delta = if k == 0 { *method_id } else { method_id - prev };
                prev = *method_id;
                encode_uleb(&mut encoded, delta);
                let method = &class.virtual_methods[*mi];
                let access = if method.is_abstract {
                    ACC_PUBLIC | ACC_ABSTRACT
                } else {
                    ACC_PUBLIC
                };
                encode_uleb(&mut encoded, access);
                encode_uleb(&mut encoded, code_offsets.get(&(ci, *mi)).copied().unwrap_or(0));
            }
            class_data_offsets.push(pos as u32);
            pos += encoded.len();
            class_data.push(Some(encoded));
        }
        let num_class_data = class_data.iter().flatten().count();

        // string data
        let mut string_data_offsets: Vec<u32> = Vec::with_capacity(num_strings);
        let mut string_payloads: Vec<Vec<u8>> = Vec::with_capacity(num_strings);
        let string_data_base = pos;
        for s in &string_list {
            let utf16_len = s.encode_utf16().count() as u32;
            let mut payload = Vec::new();
            encode_uleb(&mut payload, utf16_len);
            payload.extend_from_slice(&utf::str_to_mutf8(s));
            string_data_offsets.push(pos as u32);
            pos += payload.len();
            string_payloads.push(payload);
        }

        // map list, 4-aligned
        let map_off = (pos + 3) & !3;
        let mut map_entries: Vec<(u16, u32, u32)> = vec![(0x0000, 1, 0)];
        if num_strings > 0 {
            map_entries.push((0x0001, num_strings as u32, string_ids_off as u32));
        }
        if num_types > 0 {
            map_entries.push((0x0002, num_types as u32, type_ids_off as u32));
        }
        if num_protos > 0 {
            map_entries.push((0x0003, num_protos as u32, proto_ids_off as u32));
        }
        if num_methods > 0 {
            map_entries.push((0x0005, num_methods as u32, method_ids_off as u32));
        }
        if num_classes > 0 {
            map_entries.push((0x0006, num_classes as u32, class_defs_off as u32));
        }
        if num_code_items > 0 {
            map_entries.push((0x2001, num_code_items as u32, code_off_base as u32));
        }
        if num_class_data > 0 {
            map_entries.push((0x2000, num_class_data as u32, class_data_base as u32));
        }
        if num_strings > 0 {
            map_entries.push((0x2002, num_strings as u32, string_data_base as u32));
        }
        map_entries.push((0x1000, 1, map_off as u32));

        let file_size = map_off + 4 + 12 * map_entries.len();
        let mut buf = vec![0u8; file_size];

        // ---- header
        buf[0..8].copy_from_slice(b"dex\n039\0");
        put_u32(&mut buf, header_offset::FILE_SIZE, file_size as u32);
        put_u32(&mut buf, header_offset::HEADER_SIZE, HEADER_SIZE as u32);
        put_u32(&mut buf, header_offset::ENDIAN_TAG, super::DEX_ENDIAN_CONSTANT);
        put_u32(&mut buf, header_offset::MAP_OFF, map_off as u32);
        put_u32(&mut buf, header_offset::STRING_IDS_SIZE, num_strings as u32);
        put_u32(
            &mut buf,
            header_offset::STRING_IDS_OFF,
            if num_strings > 0 { string_ids_off as u32 } else { 0 },
        );
        put_u32(&mut buf, header_offset::TYPE_IDS_SIZE, num_types as u32);
        put_u32(
            &mut buf,
            header_offset::TYPE_IDS_OFF,
            if num_types > 0 { type_ids_off as u32 } else { 0 },
        );
        put_u32(&mut buf, header_offset::PROTO_IDS_SIZE, num_protos as u32);
        put_u32(
            &mut buf,
            header_offset::PROTO_IDS_OFF,
            if num_protos > 0 { proto_ids_off as u32 } else { 0 },
        );
        put_u32(&mut buf, header_offset::FIELD_IDS_SIZE, 0);
        put_u32(&mut buf, header_offset::FIELD_IDS_OFF, 0);
        put_u32(&mut buf, header_offset::METHOD_IDS_SIZE, num_methods as u32);
        put_u32(
            &mut buf,
            header_offset::METHOD_IDS_OFF,
            if num_methods > 0 { method_ids_off as u32 } else { 0 },
        );
        put_u32(&mut buf, header_offset::CLASS_DEFS_SIZE, num_classes as u32);
        put_u32(
            &mut buf,
            header_offset::CLASS_DEFS_OFF,
            if num_classes > 0 { class_defs_off as u32 } else { 0 },
        );
        put_u32(&mut buf, header_offset::DATA_SIZE, (file_size - data_off) as u32);
        put_u32(&mut buf, header_offset::DATA_OFF, data_off as u32);

        // ---- id tables
        for (i, off) in string_data_offsets.iter().enumerate() {
            put_u32(&mut buf, string_ids_off + 4 * i, *off);
        }
        for (i, desc) in type_list.iter().enumerate() {
            put_u32(&mut buf, type_ids_off + 4 * i, string_index[*desc]);
        }
        if has_methods {
            // single proto: ()V
            put_u32(&mut buf, proto_ids_off, string_index["V"]); // shorty
            put_u16(&mut buf, proto_ids_off + 4, type_index["V"]); // return type
            put_u16(&mut buf, proto_ids_off + 6, 0);
            put_u32(&mut buf, proto_ids_off + 8, 0); // no parameters
        }
        for (i, (class_idx, name_idx)) in method_list.iter().enumerate() {
            let off = method_ids_off + 8 * i;
            put_u16(&mut buf, off, *class_idx);
            put_u16(&mut buf, off + 2, 0); // proto 0
            put_u32(&mut buf, off + 4, *name_idx);
        }

        // ---- class defs
        for (i, class) in self.classes.iter().enumerate() {
            let off = class_defs_off + 32 * i;
            put_u16(&mut buf, off, type_index[class.descriptor.as_str()]);
            put_u16(&mut buf, off + 2, 0);
            put_u32(&mut buf, off + 4, class.access_flags);
            match &class.superclass {
                Some(superclass) => {
                    put_u16(&mut buf, off + 8, type_index[superclass.as_str()]);
                    put_u16(&mut buf, off + 10, 0);
                }
                None => {
                    put_u16(&mut buf, off + 8, NO_INDEX16);
                    put_u16(&mut buf, off + 10, NO_INDEX16);
                }
            }
            put_u32(&mut buf, off + 12, 0); // interfaces
            put_u32(&mut buf, off + 16, NO_INDEX); // source file
            put_u32(&mut buf, off + 20, 0); // annotations
            put_u32(&mut buf, off + 24, class_data_offsets[i]);
            put_u32(&mut buf, off + 28, 0); // static values
        }

        // ---- code items: registers=1, ins=1, outs=0, no tries, return-void
        for code_off in code_offsets.values() {
            let off = *code_off as usize;
            put_u16(&mut buf, off, 1); // registers_size
            put_u16(&mut buf, off + 2, 1); // ins_size
            put_u16(&mut buf, off + 4, 0); // outs_size
            put_u16(&mut buf, off + 6, 0); // tries_size
            put_u32(&mut buf, off + 8, 0); // debug_info_off
            put_u32(&mut buf, off + 12, 1); // insns_size
            put_u16(&mut buf, off + 16, 0x000e); // return-void
        }

        // ---- class data and string data
        for (i, encoded) in class_data.iter().enumerate() {
            if let Some(encoded) = encoded {
                let off = class_data_offsets[i] as usize;
                buf[off..off + encoded.len()].copy_from_slice(encoded);
            }
        }
        for (i, payload) in string_payloads.iter().enumerate() {
            let off = string_data_offsets[i] as usize;
            buf[off..off + payload.len()].copy_from_slice(payload);
        }

        // ---- map list
        put_u32(&mut buf, map_off, map_entries.len() as u32);
        for (i, (ty, size, off)) in map_entries.iter().enumerate() {
            let entry_off = map_off + 4 + 12 * i;
            put_u16(&mut buf, entry_off, *ty);
            put_u16(&mut buf, entry_off + 2, 0);
            put_u32(&mut buf, entry_off + 4, *size);
            put_u32(&mut buf, entry_off + 8, *off);
        }

        fix_checksum(&mut buf);
        buf
    }
}
