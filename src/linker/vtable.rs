//! Virtual method table construction.
//!
//! A class's vtable starts as its superclass's table: slot indices assigned
//! by a superclass are never renumbered further down the hierarchy. Newly
//! declared virtual methods either override the slot whose name and
//! signature they match, or append a fresh slot at the end. Each class owns
//! its vtable, so an override is applied to this class's copy only; sibling
//! classes never observe each other's overrides.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::file::ACC_FINAL;
use crate::link_err;
use crate::LinkResult;

use super::class::{Class, ClassArena, ClassId, IfTableEntry, Method, MethodRef};

/// How a vtable slot must change during interface linking. Slots with no
/// entry in the translation map are left alone; this sparse map is the only
/// communication between the interface-linking passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodTranslation {
    /// The slot must point at a different, more-derived default method.
    Translation(MethodRef),
    /// Two unrelated default implementations collide; the slot becomes a
    /// conflict sentinel and raises `IncompatibleClassChangeError` when
    /// invoked.
    Conflict,
    /// No concrete default applies any more; the slot becomes an abstract
    /// (miranda) sentinel raising `AbstractMethodError`.
    Abstract,
}

pub type TranslationMap = BTreeMap<u16, MethodTranslation>;

/// Mutable state of a class while it is being linked. Published as a
/// `ClassLink` once every table is built.
pub(crate) struct LinkingClass {
    pub id: ClassId,
    pub descriptor: Arc<str>,
    pub access_flags: u32,
    pub superclass: Option<Arc<Class>>,
    pub interfaces: Vec<Arc<Class>>,
    pub methods: Vec<Method>,
    pub virtual_start: u16,
    pub copied_start: u16,
    pub vtable: Vec<MethodRef>,
    pub iftable: Vec<IfTableEntry>,
}

impl LinkingClass {
    pub fn is_interface(&self) -> bool {
        self.access_flags & crate::file::ACC_INTERFACE != 0
    }

    /// Self reference to one of this class's methods.
    pub fn method_ref(&self, index: usize) -> MethodRef {
        MethodRef {
            class: self.id,
            index: index as u16,
        }
    }
}

/// Resolves a method handle against either the class being linked or an
/// already-resolved class in the arena.
pub(crate) fn resolve_method(arena: &ClassArena, lc: &LinkingClass, m: MethodRef) -> Method {
    if m.class == lc.id {
        lc.methods[m.index as usize].clone()
    } else {
        arena
            .get(m.class)
            .method(m.index)
            .expect("referenced class is resolved")
            .clone()
    }
}

/// Builds the vtable for `lc`. Interfaces get no vtable; their virtual
/// methods are numbered by declaration order for iftable indexing.
pub(crate) fn link_virtual_methods(arena: &ClassArena, lc: &mut LinkingClass) -> LinkResult<()> {
    let virtual_range = lc.virtual_start as usize..lc.copied_start as usize;

    if lc.is_interface() {
        for (i, index) in virtual_range.enumerate() {
            lc.methods[index].method_index = i as u16;
        }
        return Ok(());
    }

    let super_vtable: Vec<MethodRef> = match &lc.superclass {
        Some(superclass) => superclass
            .link()
            .map(|link| link.vtable.clone())
            .unwrap_or_default(),
        None => Vec::new(),
    };
    lc.vtable = super_vtable.clone();

    for index in virtual_range {
        let name = lc.methods[index].name.clone();
        let signature = lc.methods[index].signature.clone();

        // first name+signature match in superclass slot order wins
        let mut matched: Option<(usize, Method)> = None;
        for (slot, target) in super_vtable.iter().enumerate() {
            let target_method = resolve_method(arena, lc, *target);
            if target_method.name == name && target_method.signature == signature {
                matched = Some((slot, target_method));
                break;
            }
        }

        match matched {
            Some((slot, target_method)) => {
                if target_method.access_flags & ACC_FINAL != 0 {
                    return link_err!(
                        VerifyError,
                        "method {}.{}{} overrides final method in {}",
                        lc.descriptor,
                        name,
                        signature,
                        resolve_declaring_descriptor(arena, super_vtable[slot])
                    );
                }
                lc.vtable[slot] = lc.method_ref(index);
                lc.methods[index].method_index = slot as u16;
            }
            None => {
                if lc.vtable.len() >= u16::MAX as usize {
                    return link_err!(
                        ClassFormat,
                        "too many virtual methods in {}",
                        lc.descriptor
                    );
                }
                lc.methods[index].method_index = lc.vtable.len() as u16;
                let method_ref = lc.method_ref(index);
                lc.vtable.push(method_ref);
            }
        }
    }
    Ok(())
}

fn resolve_declaring_descriptor(arena: &ClassArena, m: MethodRef) -> Arc<str> {
    arena.get(m.class).descriptor.clone()
}
