//! Interface linking: iftable construction, default method resolution and
//! the copied-method machinery (mirandas, default copies, conflict
//! sentinels).

use log::debug;

use crate::file::{ACC_ABSTRACT, ACC_PUBLIC};
use crate::link_err;
use crate::LinkResult;

use super::class::{
    ClassArena, ClassId, IfTableEntry, Method, MethodRef, ACC_COPIED, ACC_DEFAULT,
    ACC_DEFAULT_CONFLICT, ACC_MIRANDA,
};
use super::vtable::{resolve_method, LinkingClass, MethodTranslation, TranslationMap};

/// Outcome of searching a class's interfaces for a default implementation
/// of one interface method slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultMethodSearchResult {
    /// Exactly one unmasked default implementation applies.
    DefaultFound(MethodRef),
    /// No default applies; the slot stays (or becomes) abstract.
    AbstractFound,
    /// Two or more unrelated interfaces provide defaults for the slot.
    DefaultConflict,
}

/// Declared virtual methods of one interface, with the data needed to form
/// method handles into it.
pub(crate) struct InterfaceMethods {
    id: ClassId,
    virtual_start: u16,
    methods: Vec<Method>,
}

fn interface_methods(arena: &ClassArena, id: ClassId) -> InterfaceMethods {
    let class = arena.get(id);
    let link = class.link().expect("interface is resolved before use");
    InterfaceMethods {
        id,
        virtual_start: link.virtual_start,
        methods: link.declared_virtual_methods().to_vec(),
    }
}

/// Whether interface `sub` (transitively) extends interface `sup`.
fn interface_extends(arena: &ClassArena, sub: ClassId, sup: ClassId) -> bool {
    if sub == sup {
        return false;
    }
    arena
        .get(sub)
        .link()
        .map(|link| link.iftable.iter().any(|e| e.interface == sup))
        .unwrap_or(false)
}

/// The flattened interface list: the superclass's iftable first (so its
/// entry order is a prefix, like vtable slots), then each direct interface
/// preceded by its transitive super-interfaces, without duplicates.
fn collect_interfaces(lc: &LinkingClass) -> Vec<ClassId> {
    let mut out: Vec<ClassId> = Vec::new();
    let mut push = |out: &mut Vec<ClassId>, id: ClassId| {
        if !out.contains(&id) {
            out.push(id);
        }
    };

    if let Some(superclass) = &lc.superclass {
        if let Some(link) = superclass.link() {
            for entry in &link.iftable {
                push(&mut out, entry.interface);
            }
        }
    }
    for iface in &lc.interfaces {
        if let Some(link) = iface.link() {
            for entry in &link.iftable {
                push(&mut out, entry.interface);
            }
        }
        push(&mut out, iface.id);
    }
    out
}

/// Searches every implemented interface for a default implementation of
/// `target`, masking candidates that a more specific sub-interface
/// overrides. One survivor wins; several unrelated survivors conflict, even
/// when they share a common ancestor (the ancestor's default is masked by
/// both).
pub(crate) fn find_default_method_implementation(
    arena: &ClassArena,
    ifaces: &[InterfaceMethods],
    target: &Method,
) -> DefaultMethodSearchResult {
    let mut candidates: Vec<(ClassId, MethodRef)> = Vec::new();
    for iface in ifaces {
        for (j, m) in iface.methods.iter().enumerate() {
            if m.same_name_and_signature(target) {
                if !m.is_abstract() {
                    candidates.push((
                        iface.id,
                        MethodRef {
                            class: iface.id,
                            index: iface.virtual_start + j as u16,
                        },
                    ));
                }
                break;
            }
        }
    }

    let survivors: Vec<MethodRef> = candidates
        .iter()
        .filter(|(cid, _)| {
            !candidates
                .iter()
                .any(|(oid, _)| oid != cid && interface_extends(arena, *oid, *cid))
        })
        .map(|(_, m)| *m)
        .collect();

    match survivors.len() {
        0 => DefaultMethodSearchResult::AbstractFound,
        1 => DefaultMethodSearchResult::DefaultFound(survivors[0]),
        _ => DefaultMethodSearchResult::DefaultConflict,
    }
}

fn make_copied_default(source: &Method, vtable_slot: u16) -> Method {
    Method {
        name: source.name.clone(),
        signature: source.signature.clone(),
        access_flags: (source.access_flags | ACC_COPIED | ACC_DEFAULT) & !ACC_ABSTRACT,
        code_off: source.code_off,
        method_index: vtable_slot,
    }
}

fn make_miranda(source: &Method, vtable_slot: u16) -> Method {
    Method {
        name: source.name.clone(),
        signature: source.signature.clone(),
        access_flags: ACC_PUBLIC | ACC_ABSTRACT | ACC_COPIED | ACC_MIRANDA,
        code_off: 0,
        method_index: vtable_slot,
    }
}

fn make_conflict(source: &Method, vtable_slot: u16) -> Method {
    Method {
        name: source.name.clone(),
        signature: source.signature.clone(),
        access_flags: ACC_PUBLIC | ACC_COPIED | ACC_DEFAULT | ACC_DEFAULT_CONFLICT,
        code_off: 0,
        method_index: vtable_slot,
    }
}

/// Builds the iftable for `lc` and resolves every interface method slot to
/// a class method, a default method, a miranda, or a conflict sentinel.
/// Returns the translation map that was applied to the vtable.
pub(crate) fn link_interface_methods(
    arena: &ClassArena,
    lc: &mut LinkingClass,
) -> LinkResult<TranslationMap> {
    let interface_ids = collect_interfaces(lc);

    if lc.is_interface() {
        // interfaces carry their transitive super-interfaces but no
        // per-interface dispatch arrays
        lc.iftable = interface_ids
            .into_iter()
            .map(|interface| IfTableEntry {
                interface,
                methods: Vec::new(),
            })
            .collect();
        return Ok(TranslationMap::new());
    }

    let ifaces: Vec<InterfaceMethods> = interface_ids
        .iter()
        .map(|id| interface_methods(arena, *id))
        .collect();

    let mut translations = TranslationMap::new();
    let mut entries: Vec<IfTableEntry> = Vec::with_capacity(ifaces.len());
    // (entry, method slot in entry, vtable slot) resolved after the
    // translation map is applied
    let mut pending: Vec<(usize, usize, u16)> = Vec::new();
    const PLACEHOLDER: u16 = u16::MAX;

    for (ei, iface) in ifaces.iter().enumerate() {
        let mut entry = IfTableEntry {
            interface: iface.id,
            methods: Vec::with_capacity(iface.methods.len()),
        };

        for (j, interface_method) in iface.methods.iter().enumerate() {
            // 1. the most derived class method with a matching signature
            let mut hit: Option<(usize, Method)> = None;
            for k in (0..lc.vtable.len()).rev() {
                let target = resolve_method(arena, lc, lc.vtable[k]);
                if target.same_name_and_signature(interface_method) {
                    hit = Some((k, target));
                    break;
                }
            }

            match hit {
                Some((k, target))
                    if !target.is_copied() && !target.is_static() && !target.is_private() =>
                {
                    // a declared method of this class or a superclass
                    entry.methods.push(lc.vtable[k]);
                    continue;
                }
                Some((k, target)) => {
                    // the slot was synthesized for a superclass's interface
                    // set; re-resolve against this class's interfaces
                    let slot = k as u16;
                    match find_default_method_implementation(arena, &ifaces, interface_method) {
                        DefaultMethodSearchResult::DefaultFound(def) => {
                            translations.insert(slot, MethodTranslation::Translation(def));
                        }
                        DefaultMethodSearchResult::DefaultConflict => {
                            translations.insert(slot, MethodTranslation::Conflict);
                        }
                        DefaultMethodSearchResult::AbstractFound => {
                            if !target.is_abstract() {
                                translations.insert(slot, MethodTranslation::Abstract);
                            }
                        }
                    }
                    entry.methods.push(MethodRef {
                        class: lc.id,
                        index: PLACEHOLDER,
                    });
                    pending.push((ei, j, slot));
                }
                None => {
                    let slot = lc.vtable.len();
                    if slot >= u16::MAX as usize {
                        return link_err!(
                            ClassFormat,
                            "too many virtual methods in {}",
                            lc.descriptor
                        );
                    }
                    let copied = match find_default_method_implementation(
                        arena,
                        &ifaces,
                        interface_method,
                    ) {
                        DefaultMethodSearchResult::DefaultFound(def) => {
                            let source = resolve_method(arena, lc, def);
                            make_copied_default(&source, slot as u16)
                        }
                        DefaultMethodSearchResult::DefaultConflict => {
                            debug!(
                                "conflicting default methods for {}{} in {}",
                                interface_method.name, interface_method.signature, lc.descriptor
                            );
                            make_conflict(interface_method, slot as u16)
                        }
                        DefaultMethodSearchResult::AbstractFound => {
                            make_miranda(interface_method, slot as u16)
                        }
                    };
                    lc.methods.push(copied);
                    let method_ref = lc.method_ref(lc.methods.len() - 1);
                    lc.vtable.push(method_ref);
                    entry.methods.push(method_ref);
                }
            }
        }
        entries.push(entry);
    }

    apply_translations(arena, lc, &translations)?;

    for (ei, j, slot) in pending {
        entries[ei].methods[j] = lc.vtable[slot as usize];
    }
    lc.iftable = entries;
    Ok(translations)
}

/// Applies the recorded slot rewrites: translated slots point at a fresh
/// copy of the chosen default, conflict slots at a conflict sentinel,
/// abstracted slots at a miranda.
fn apply_translations(
    arena: &ClassArena,
    lc: &mut LinkingClass,
    translations: &TranslationMap,
) -> LinkResult<()> {
    for (&slot, translation) in translations {
        let current = resolve_method(arena, lc, lc.vtable[slot as usize]);
        let replacement = match translation {
            MethodTranslation::Translation(def) => {
                let source = resolve_method(arena, lc, *def);
                // the slot may already hold an equivalent copy of this
                // default from an earlier pass over another interface
                if current.is_default()
                    && !current.is_default_conflicting()
                    && lc.vtable[slot as usize].class == lc.id
                    && current.code_off == source.code_off
                    && current.same_name_and_signature(&source)
                {
                    continue;
                }
                make_copied_default(&source, slot)
            }
            MethodTranslation::Conflict => {
                if current.is_default_conflicting() && lc.vtable[slot as usize].class == lc.id {
                    continue;
                }
                make_conflict(&current, slot)
            }
            MethodTranslation::Abstract => make_miranda(&current, slot),
        };
        lc.methods.push(replacement);
        lc.vtable[slot as usize] = lc.method_ref(lc.methods.len() - 1);
    }
    Ok(())
}
