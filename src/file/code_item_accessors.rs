use crate::{leb128, Result};

use super::{CatchHandlerData, CodeItem, DexContainer, DexFile, TryItem, TypeIndex};

// ----------------------------------------------------------------------------
// CodeItemAccessor
// ----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct CodeItemAccessor<'a> {
    code_off: u32,
    code_item: &'a CodeItem,
    insns: &'a [u16],
}

impl<'a> CodeItemAccessor<'a> {
    #[inline]
    pub fn insns_size_in_code_units(&self) -> u32 {
        self.insns.len() as u32
    }

    #[inline]
    pub fn insns_size_in_bytes(&self) -> u32 {
        self.insns.len() as u32 * 2
    }

    #[inline(always)]
    pub fn insns(&self) -> &'a [u16] {
        self.insns
    }

    /// Offset of the try items relative to the start of the instruction
    /// stream, if any. Try items are 4-byte aligned, so an odd number of
    /// code units is followed by two bytes of padding.
    #[inline]
    pub fn get_tries_off(&self) -> Option<usize> {
        if self.tries_size() == 0 {
            return None;
        }

        let offset = self.insns_size_in_bytes() as usize;
        let padding = if self.insns.len() % 2 == 1 { 2 } else { 0 };
        Some(offset + padding)
    }

    #[inline]
    pub fn get_tries_abs_off(&self) -> Option<usize> {
        self.get_tries_off()
            .map(|tries_off| tries_off + self.insns_off() as usize)
    }

    #[inline]
    pub fn get_catch_handler_data_off(&self) -> Option<usize> {
        self.get_tries_off().map(|tries_off| {
            tries_off + self.tries_size() as usize * std::mem::size_of::<TryItem>()
        })
    }

    #[inline]
    pub fn get_catch_handler_data_abs_off(&self) -> Option<usize> {
        self.get_catch_handler_data_off()
            .map(|data_off| data_off + self.insns_off() as usize)
    }

    #[inline]
    pub fn has_code(&self) -> bool {
        !self.insns.is_empty()
    }

    #[inline(always)]
    pub fn from_code_item<C>(
        dex: &DexFile<'a, C>,
        code_item: &'a CodeItem,
        code_off: u32,
    ) -> Result<CodeItemAccessor<'a>>
    where
        C: DexContainer<'a>,
    {
        let insns = match code_off {
            0 => &[],
            _ => dex.get_insns_raw(code_off, code_item.insns_size)?,
        };
        Ok(CodeItemAccessor {
            code_off,
            code_item,
            insns,
        })
    }

    pub fn insns_off(&self) -> u32 {
        self.code_off
    }

    pub fn code_item_off(&self) -> u32 {
        self.code_off - std::mem::size_of::<CodeItem>() as u32
    }

    pub fn code_item(&self) -> &'a CodeItem {
        self.code_item
    }

    pub fn registers_size(&self) -> u16 {
        self.code_item.registers_size
    }

    pub fn ins_size(&self) -> u16 {
        self.code_item.ins_size
    }

    pub fn outs_size(&self) -> u16 {
        self.code_item.outs_size
    }

    pub fn tries_size(&self) -> u16 {
        self.code_item.tries_size
    }

    pub fn debug_info_off(&self) -> u32 {
        self.code_item.debug_info_off
    }
}

impl<'a, C: DexContainer<'a>> DexFile<'a, C> {
    pub fn get_try_item(&'a self, ca: &CodeItemAccessor<'_>) -> Result<&'a [TryItem]> {
        match ca.get_tries_abs_off() {
            Some(offset) => self.get_try_items_raw(offset as u32, ca.tries_size()),
            None => Ok(&[]),
        }
    }
}

// ----------------------------------------------------------------------------
// EncodedCatchHandler Iterator
// ----------------------------------------------------------------------------

pub struct EncodedCatchHandlerIterator<'a> {
    data: &'a [u8],
    offset: usize,
    has_catch_all: bool,
    remaining: i32,
}

impl<'a> EncodedCatchHandlerIterator<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut pos = 0;
        // If the count is non-positive, it is the negative of the number of
        // catch types, and the catches are followed by a catch-all handler.
        let remaining = leb128::decode_sleb128(data, &mut pos)?;
        Ok(Self {
            data,
            offset: pos,
            has_catch_all: remaining <= 0,
            remaining: remaining.unsigned_abs().min(i32::MAX as u32) as i32,
        })
    }

    /// Byte offset just past the entries consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn leb128(&mut self) -> Result<u32> {
        leb128::decode_leb128_at::<u32>(self.data, &mut self.offset)
    }
}

impl<'a> Iterator for EncodedCatchHandlerIterator<'a> {
    type Item = Result<CatchHandlerData>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == -1 {
            return None;
        }

        let mut handler = CatchHandlerData::default();
        if self.remaining > 0 {
            let entry = self.leb128().and_then(|type_idx| {
                handler.type_idx = type_idx as TypeIndex;
                handler.address = self.leb128()?;
                Ok(handler.clone())
            });
            if entry.is_err() {
                self.remaining = -1;
                return Some(entry);
            }
            self.remaining -= 1;
            return Some(entry);
        }

        if self.has_catch_all {
            self.has_catch_all = false;
            let entry = self.leb128().map(|addr| {
                handler.is_catch_all = true;
                handler.type_idx = TypeIndex::MAX;
                handler.address = addr;
                handler.clone()
            });
            if entry.is_err() {
                self.remaining = -1;
                return Some(entry);
            }
            self.remaining = -1;
            return Some(entry);
        }

        self.remaining = -1;
        None
    }
}
