use memmap2::Mmap;

use super::{ClassDef, DexContainer, DexFile, FieldId, InvokeType, MethodId, ACC_STATIC};
use crate::{
    dex_err,
    file::{ACC_CONSTRUCTOR, ACC_INTERFACE},
    leb128::decode_leb128_at,
    Result,
};

/// Read protocol for the delta-encoded member records of a
/// `class_data_item`. Indices accumulate across records; an accumulated
/// index that would overflow a `u32` is rejected.
pub trait ClassItemBase<'a, C: DexContainer<'a>>: Copy + Clone {
    fn read(&mut self, data: &'a [u8], pos: &mut usize) -> Result<()>;

    fn init(dex: &'a DexFile<'a, C>) -> Self;

    fn next_section(&mut self);
}

fn accumulate_index(index: u32, delta: u32, item_ty: &'static str) -> Result<u32> {
    match index.checked_add(delta) {
        Some(next) => Ok(next),
        None => dex_err!(BadEncodedIndex {
            index,
            next_index: delta,
            item_ty
        }),
    }
}

pub struct Method<'a, C: DexContainer<'a> = Mmap> {
    dex: &'a DexFile<'a, C>,

    pub index: u32,
    pub access_flags: u32,
    pub code_offset: u32,
    pub is_static_or_direct: bool,
}

impl<'a, C: DexContainer<'a>> Clone for Method<'a, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, C: DexContainer<'a>> Copy for Method<'a, C> {}

impl<'a, C: DexContainer<'a>> Method<'a, C> {
    #[inline]
    pub fn get_direct_invoke_type(&self) -> InvokeType {
        if self.access_flags & ACC_STATIC != 0 {
            InvokeType::Static
        } else {
            InvokeType::Direct
        }
    }

    #[inline(always)]
    pub fn get_method_id(&self) -> Result<&'a MethodId> {
        self.dex.get_method_id(self.index)
    }

    #[inline(always)]
    pub fn get_virtual_invoke_type(&self, class_access_flags: u32) -> InvokeType {
        debug_assert!(self.access_flags & ACC_STATIC == 0x00);
        if class_access_flags & ACC_INTERFACE != 0 {
            InvokeType::Interface
        } else if self.access_flags & ACC_CONSTRUCTOR != 0 {
            InvokeType::Super
        } else {
            InvokeType::Virtual
        }
    }
}

impl<'a, C: DexContainer<'a>> ClassItemBase<'a, C> for Method<'a, C> {
    fn read(&mut self, data: &'a [u8], pos: &mut usize) -> Result<()> {
        let delta = decode_leb128_at::<u32>(data, pos)?;
        self.index = accumulate_index(self.index, delta, "Method")?;
        self.access_flags = decode_leb128_at(data, pos)?;
        self.code_offset = decode_leb128_at(data, pos)?;
        Ok(())
    }

    fn init(dex: &'a DexFile<'a, C>) -> Self {
        Self {
            dex,
            index: 0,
            access_flags: 0,
            code_offset: 0,
            is_static_or_direct: true,
        }
    }

    fn next_section(&mut self) {
        self.is_static_or_direct = false;
        // each member list restarts the delta encoding
        self.index = 0;
    }
}

pub struct Field<'a, C: DexContainer<'a> = Mmap> {
    dex: &'a DexFile<'a, C>,

    pub index: u32,
    pub access_flags: u32,
    pub is_static: bool,
}

impl<'a, C: DexContainer<'a>> Clone for Field<'a, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, C: DexContainer<'a>> Copy for Field<'a, C> {}

impl<'a, C: DexContainer<'a>> Field<'a, C> {
    #[inline(always)]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn get_field_id(&self) -> Result<&'a FieldId> {
        self.dex.get_field_id(self.index)
    }
}

impl<'a, C: DexContainer<'a>> ClassItemBase<'a, C> for Field<'a, C> {
    fn read(&mut self, data: &'a [u8], pos: &mut usize) -> Result<()> {
        let delta = decode_leb128_at::<u32>(data, pos)?;
        self.index = accumulate_index(self.index, delta, "Field")?;
        self.access_flags = decode_leb128_at(data, pos)?;
        Ok(())
    }

    fn init(dex: &'a DexFile<'a, C>) -> Self {
        Self {
            dex,
            index: 0,
            access_flags: 0,
            is_static: true,
        }
    }

    fn next_section(&mut self) {
        self.is_static = false;
        self.index = 0;
    }
}

/// Streaming view over a `class_data_item`: static fields, instance fields,
/// direct methods, virtual methods, in that order. Nothing is materialized;
/// each call decodes from the underlying bytes.
pub struct ClassAccessor<'a, C: DexContainer<'a> = Mmap> {
    dex: &'a DexFile<'a, C>,
    class_data: &'a [u8],

    pub num_static_fields: u32,
    pub num_instance_fields: u32,
    pub num_direct_methods: u32,
    pub num_virtual_methods: u32,

    // byte offset of the first static field record
    static_fields_off: usize,
}

impl<'a, C: DexContainer<'a>> DexFile<'a, C> {
    pub fn get_class_accessor(
        &'a self,
        class_def: &ClassDef,
    ) -> Result<Option<ClassAccessor<'a, C>>> {
        match class_def.class_data_off {
            0 => Ok(None),
            off if (off as usize) < self.file_size() => Ok(Some(ClassAccessor::from_raw(
                self,
                &self.data()[off as usize..],
            )?)),
            off => dex_err!(BadOffsetTooLarge {
                offset: off,
                size: self.file_size(),
                section: "class-data"
            }),
        }
    }
}

impl<'a, C: DexContainer<'a>> ClassAccessor<'a, C> {
    pub fn from_raw(dex: &'a DexFile<'a, C>, class_data: &'a [u8]) -> Result<Self> {
        let mut pos = 0;
        let num_static_fields = decode_leb128_at(class_data, &mut pos)?;
        let num_instance_fields = decode_leb128_at(class_data, &mut pos)?;
        let num_direct_methods = decode_leb128_at(class_data, &mut pos)?;
        let num_virtual_methods = decode_leb128_at(class_data, &mut pos)?;
        Ok(Self {
            dex,
            class_data,
            num_static_fields,
            num_instance_fields,
            num_direct_methods,
            num_virtual_methods,
            static_fields_off: pos,
        })
    }

    #[inline(always)]
    pub fn num_fields(&self) -> usize {
        self.num_instance_fields as usize + self.num_static_fields as usize
    }

    #[inline(always)]
    pub fn num_methods(&self) -> usize {
        self.num_direct_methods as usize + self.num_virtual_methods as usize
    }

    pub fn visit_fields_and_methods(
        &self,
        mut static_field_visitor: impl FnMut(&Field<'a, C>) -> Result<()>,
        mut instance_field_visitor: impl FnMut(&Field<'a, C>) -> Result<()>,
        mut direct_method_visitor: impl FnMut(&Method<'a, C>) -> Result<()>,
        mut virtual_method_visitor: impl FnMut(&Method<'a, C>) -> Result<()>,
    ) -> Result<()> {
        let mut offset = self.static_fields_off;

        let mut field = Field::init(self.dex);
        self.visit_members(
            self.num_static_fields,
            &mut offset,
            &mut static_field_visitor,
            &mut field,
        )?;
        field.next_section();
        self.visit_members(
            self.num_instance_fields,
            &mut offset,
            &mut instance_field_visitor,
            &mut field,
        )?;

        let mut method = Method::init(self.dex);
        self.visit_members(
            self.num_direct_methods,
            &mut offset,
            &mut direct_method_visitor,
            &mut method,
        )?;
        method.next_section();
        self.visit_members(
            self.num_virtual_methods,
            &mut offset,
            &mut virtual_method_visitor,
            &mut method,
        )
    }

    pub fn visit_fields(
        &self,
        static_field_visitor: impl FnMut(&Field<'a, C>) -> Result<()>,
        instance_field_visitor: impl FnMut(&Field<'a, C>) -> Result<()>,
    ) -> Result<()> {
        self.visit_fields_and_methods(
            static_field_visitor,
            instance_field_visitor,
            |_| Ok(()),
            |_| Ok(()),
        )
    }

    pub fn visit_methods(
        &self,
        direct_method_visitor: impl FnMut(&Method<'a, C>) -> Result<()>,
        virtual_method_visitor: impl FnMut(&Method<'a, C>) -> Result<()>,
    ) -> Result<()> {
        self.visit_fields_and_methods(
            |_| Ok(()),
            |_| Ok(()),
            direct_method_visitor,
            virtual_method_visitor,
        )
    }

    #[inline(always)]
    pub fn get_fields(&self) -> DataIterator<'a, C, Field<'a, C>> {
        DataIterator::new(
            self.dex,
            self.class_data,
            self.static_fields_off,
            self.num_static_fields as usize,
            self.num_fields(),
        )
    }

    #[inline(always)]
    pub fn get_static_fields(&self) -> impl Iterator<Item = Result<Field<'a, C>>> {
        DataIterator::new(
            self.dex,
            self.class_data,
            self.static_fields_off,
            self.num_static_fields as usize,
            self.num_static_fields as usize,
        )
    }

    #[inline(always)]
    pub fn get_instance_fields(&self) -> impl Iterator<Item = Result<Field<'a, C>>> {
        self.get_fields().skip(self.num_static_fields as usize)
    }

    pub fn get_methods(&self) -> Result<DataIterator<'a, C, Method<'a, C>>> {
        // skip past the field records to find the first method record
        let mut offset = self.static_fields_off;
        let mut field = Field::init(self.dex);
        let mut ignore = |_: &Field<'a, C>| Ok(());
        self.visit_members(self.num_fields() as u32, &mut offset, &mut ignore, &mut field)?;
        Ok(DataIterator::new(
            self.dex,
            self.class_data,
            offset,
            self.num_direct_methods as usize,
            self.num_methods(),
        ))
    }

    pub fn get_direct_methods(&self) -> Result<impl Iterator<Item = Result<Method<'a, C>>>> {
        Ok(self.get_methods()?.take(self.num_direct_methods as usize))
    }

    pub fn get_virtual_methods(&self) -> Result<impl Iterator<Item = Result<Method<'a, C>>>> {
        Ok(self.get_methods()?.skip(self.num_direct_methods as usize))
    }

    fn visit_members<T, F>(
        &self,
        count: u32,
        offset: &mut usize,
        visitor: &mut F,
        iter: &mut T,
    ) -> Result<()>
    where
        T: ClassItemBase<'a, C>,
        F: FnMut(&T) -> Result<()>,
    {
        for _ in 0..count {
            iter.read(self.class_data, offset)?;
            visitor(iter)?;
        }
        Ok(())
    }
}

pub struct DataIterator<'a, C: DexContainer<'a>, T: ClassItemBase<'a, C>> {
    class_data: &'a [u8],
    value: T,

    pos: usize,           // mutable
    off: usize,           // mutable
    partition_pos: usize, // const
    end_pos: usize,       // const
    failed: bool,
    _container: std::marker::PhantomData<&'a C>,
}

impl<'a, C: DexContainer<'a>, T: ClassItemBase<'a, C>> DataIterator<'a, C, T> {
    pub fn new(
        dex: &'a DexFile<'a, C>,
        class_data: &'a [u8],
        start_pos: usize,
        partition_pos: usize,
        end_pos: usize,
    ) -> Self {
        Self {
            class_data,
            value: T::init(dex),
            pos: 0,
            partition_pos,
            off: start_pos,
            end_pos,
            failed: false,
            _container: std::marker::PhantomData,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.failed && self.pos < self.end_pos
    }

    pub fn offset(&self) -> usize {
        self.off
    }
}

impl<'a, C: DexContainer<'a>, T: ClassItemBase<'a, C>> Iterator for DataIterator<'a, C, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.is_valid() {
            return None;
        }
        if self.pos == self.partition_pos {
            self.value.next_section();
        }
        if let Err(err) = self.value.read(self.class_data, &mut self.off) {
            self.failed = true;
            return Some(Err(err));
        }
        self.pos += 1;
        Some(Ok(self.value))
    }
}
