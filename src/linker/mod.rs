//! Class linking: turns verified class metadata into a navigable model with
//! vtables, interface tables and field layouts.
//!
//! The [`ClassLinker`] is an explicit context object constructed at startup
//! and threaded through every entry point; there is no global runtime
//! state. Linking a class requires its superclass to be linked first, so
//! resolution is topologically ordered by inheritance depth. A per-class
//! mutex/condvar pair serializes the `Resolving -> Resolved` transition:
//! one thread drives it, every other thread blocks until the class is
//! resolved or erroneous, and a failure is cached on the class and
//! re-thrown on every later use.

pub mod class;
pub mod fields;
pub mod imtable;
pub mod interfaces;
pub mod vtable;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::thread::ThreadId;

use dashmap::DashMap;
use log::{debug, warn};

use crate::error::LinkError;
use crate::file::{
    DexContainer, DexFile, TypeLookupTable, ACC_FINAL, ACC_PUBLIC, ACC_STATIC, NO_INDEX16,
};
use crate::link_err;
use crate::{utf, LinkResult};

use self::class::{
    Class, ClassArena, ClassId, ClassLink, ClassStatus, Field, Method, MethodRef, RawClass,
    RawField, RawMethod, ACC_DEFAULT,
};
use self::fields::{link_fields, FieldLayout, OBJECT_HEADER_SIZE};
use self::imtable::{ImTable, ImtSlot};
use self::interfaces::link_interface_methods;
use self::vtable::{link_virtual_methods, LinkingClass};

pub use self::imtable::IMT_SIZE;
pub use self::vtable::MethodTranslation;

/// Hook run for `<clinit>` when a class is initialized. The excluded
/// interpreter would live behind this seam; tests inject their own.
pub type ClassInitializer<'d, C> =
    dyn Fn(&ClassLinker<'d, C>, ClassId) -> LinkResult<()> + Send + Sync + 'd;

struct RegisteredDex<'d, C: DexContainer<'d>> {
    dex: &'d DexFile<'d, C>,
    lookup: Option<TypeLookupTable<'d, C>>,
}

/// Cloneable view of a method, for consumers that hold only handles.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name: Arc<str>,
    pub signature: Arc<str>,
    pub access_flags: u32,
}

pub struct ClassLinker<'d, C: DexContainer<'d>> {
    dex_files: Vec<RegisteredDex<'d, C>>,
    class_table: DashMap<String, ClassId>,
    arena: ClassArena,
    initializer: Option<Box<ClassInitializer<'d, C>>>,
}

impl<'d, C: DexContainer<'d>> Default for ClassLinker<'d, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d, C: DexContainer<'d>> ClassLinker<'d, C> {
    pub fn new() -> Self {
        Self {
            dex_files: Vec::new(),
            class_table: DashMap::new(),
            arena: ClassArena::default(),
            initializer: None,
        }
    }

    /// Registers a verified dex file as a source of class definitions.
    pub fn register_dex(&mut self, dex: &'d DexFile<'d, C>) -> crate::Result<()> {
        let lookup = if dex.num_class_defs() > 0 {
            Some(TypeLookupTable::create(dex)?)
        } else {
            None
        };
        self.dex_files.push(RegisteredDex { dex, lookup });
        Ok(())
    }

    pub fn set_initializer(
        &mut self,
        hook: impl Fn(&ClassLinker<'d, C>, ClassId) -> LinkResult<()> + Send + Sync + 'd,
    ) {
        self.initializer = Some(Box::new(hook));
    }

    /// Defines the primordial `Ljava/lang/Object;` if nothing else has.
    pub fn bootstrap(&self) -> LinkResult<ClassId> {
        self.define_raw_class(&RawClass {
            descriptor: "Ljava/lang/Object;".to_string(),
            access_flags: ACC_PUBLIC,
            ..RawClass::default()
        })
    }

    pub fn arena(&self) -> &ClassArena {
        &self.arena
    }

    pub fn get_class(&self, id: ClassId) -> Arc<Class> {
        self.arena.get(id)
    }

    pub fn class_status(&self, id: ClassId) -> ClassStatus {
        self.arena.get(id).status()
    }

    /// Finds an already-defined class or defines it from a registered dex
    /// file. Waits if another thread is mid-resolution.
    pub fn find_class(&self, descriptor: &str) -> LinkResult<ClassId> {
        if let Some(id) = self.class_table.get(descriptor).map(|e| *e) {
            return self.wait_for_resolution(id);
        }

        for registered in &self.dex_files {
            let Some(lookup) = &registered.lookup else {
                continue;
            };
            let Some(class_def_idx) = lookup.lookup(descriptor, utf::str_hash(descriptor)) else {
                continue;
            };
            let raw = self.raw_class_from_dex(registered.dex, class_def_idx)?;
            return self.define_class_internal(&raw);
        }
        link_err!(NoClassDefFound, "{}", descriptor)
    }

    /// Defines and links a class from decoded metadata.
    pub fn define_raw_class(&self, raw: &RawClass) -> LinkResult<ClassId> {
        if let Some(id) = self.class_table.get(raw.descriptor.as_str()).map(|e| *e) {
            return self.wait_for_resolution(id);
        }
        self.define_class_internal(raw)
    }

    // ------------------------------------------------------------------
    // definition and linking
    // ------------------------------------------------------------------

    fn define_class_internal(&self, raw: &RawClass) -> LinkResult<ClassId> {
        let descriptor: Arc<str> = raw.descriptor.as_str().into();
        let class = self.arena.alloc(descriptor.clone(), raw.access_flags);
        self.transition(&class, ClassStatus::Idx);
        self.transition(&class, ClassStatus::Loaded);
        {
            let mut state = class.state.lock().unwrap();
            debug_assert!(state.status.can_transition_to(ClassStatus::Resolving));
            state.status = ClassStatus::Resolving;
            state.owner = Some(std::thread::current().id());
        }

        // publish before resolving the hierarchy so that cycles and
        // concurrent definitions are observable
        match self.class_table.entry(raw.descriptor.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // lost the race: retire our placeholder, use the winner
                let winner = *existing.get();
                drop(existing);
                let mut state = class.state.lock().unwrap();
                state.status = ClassStatus::Retired;
                drop(state);
                class.monitor.notify_all();
                return self.wait_for_resolution(winner);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(class.id);
            }
        }

        match self.resolve_and_link(&class, raw) {
            Ok(()) => {
                let mut state = class.state.lock().unwrap();
                debug_assert!(state.status.can_transition_to(ClassStatus::Resolved));
                state.status = ClassStatus::Resolved;
                state.owner = None;
                drop(state);
                class.monitor.notify_all();
                debug!("linked {}", class.descriptor);
                Ok(class.id)
            }
            Err(cause) => {
                warn!("failed to link {}: {}", class.descriptor, cause);
                let mut state = class.state.lock().unwrap();
                state.status = ClassStatus::ErrorUnresolved;
                state.owner = None;
                state.cause = Some(cause.clone());
                drop(state);
                class.monitor.notify_all();
                Err(cause)
            }
        }
    }

    fn resolve_and_link(&self, class: &Arc<Class>, raw: &RawClass) -> LinkResult<()> {
        // superclass strictly first
        let superclass = match &raw.superclass {
            Some(super_desc) => {
                let super_id = self.find_class(super_desc).map_err(|err| match err {
                    LinkError::ClassCircularity(_) => err,
                    _ => LinkError::NoClassDefFound(format!(
                        "superclass {} of {}: {}",
                        super_desc, raw.descriptor, err
                    )),
                })?;
                let super_class = self.arena.get(super_id);
                if super_class.is_interface() {
                    return link_err!(
                        IncompatibleClassChange,
                        "class {} has interface {} as superclass",
                        raw.descriptor,
                        super_desc
                    );
                }
                if super_class.access_flags & ACC_FINAL != 0 {
                    return link_err!(
                        VerifyError,
                        "class {} extends final class {}",
                        raw.descriptor,
                        super_desc
                    );
                }
                Some(super_class)
            }
            None => None,
        };

        let mut interfaces = Vec::with_capacity(raw.interfaces.len());
        for iface_desc in &raw.interfaces {
            let iface_id = self.find_class(iface_desc).map_err(|err| match err {
                LinkError::ClassCircularity(_) => err,
                _ => LinkError::NoClassDefFound(format!(
                    "interface {} of {}: {}",
                    iface_desc, raw.descriptor, err
                )),
            })?;
            let iface = self.arena.get(iface_id);
            if !iface.is_interface() {
                return link_err!(
                    IncompatibleClassChange,
                    "class {} implements non-interface {}",
                    raw.descriptor,
                    iface_desc
                );
            }
            interfaces.push(iface);
        }

        class
            .superclass
            .set(superclass.as_ref().map(|s| s.id))
            .ok();
        class
            .direct_interfaces
            .set(interfaces.iter().map(|i| i.id).collect())
            .ok();

        // method array: direct, declared virtual, then (later) copied
        let is_interface = class.is_interface();
        let mut methods = Vec::with_capacity(raw.direct_methods.len() + raw.virtual_methods.len());
        for m in &raw.direct_methods {
            methods.push(Self::make_method(m, false));
        }
        let virtual_start = methods.len() as u16;
        for m in &raw.virtual_methods {
            methods.push(Self::make_method(m, is_interface));
        }
        let copied_start = methods.len() as u16;

        let mut lc = LinkingClass {
            id: class.id,
            descriptor: class.descriptor.clone(),
            access_flags: class.access_flags,
            superclass: superclass.clone(),
            interfaces,
            methods,
            virtual_start,
            copied_start,
            vtable: Vec::new(),
            iftable: Vec::new(),
        };

        link_virtual_methods(&self.arena, &mut lc)?;
        let _translations = link_interface_methods(&self.arena, &mut lc)?;

        // imtable for instantiable dispatch (not for interfaces)
        let imtable = if is_interface {
            None
        } else {
            let imt = ImTable::new();
            for entry in &lc.iftable {
                for (j, implementation) in entry.methods.iter().enumerate() {
                    let iface = self.arena.get(entry.interface);
                    let iface_link = iface.link().expect("interface resolved");
                    let interface_method = MethodRef {
                        class: entry.interface,
                        index: iface_link.virtual_start + j as u16,
                    };
                    let info = vtable::resolve_method(&self.arena, &lc, *implementation);
                    if !info.is_invocable() {
                        continue;
                    }
                    let index = ImTable::imt_index(&info.name, &info.signature);
                    imt.install(index, interface_method, *implementation);
                }
            }
            Some(imt)
        };

        // field layout
        let mut fields = Vec::with_capacity(raw.static_fields.len() + raw.instance_fields.len());
        for f in &raw.static_fields {
            fields.push(Self::make_field(f));
        }
        let instance_start = fields.len() as u16;
        for f in &raw.instance_fields {
            fields.push(Self::make_field(f));
        }

        let static_layout = link_fields(
            &mut fields[..instance_start as usize],
            0,
            FieldLayout::empty(0),
        );
        let inherited = superclass
            .as_ref()
            .and_then(|s| s.link())
            .map(|l| l.instance_layout)
            .unwrap_or(FieldLayout::empty(OBJECT_HEADER_SIZE));
        let instance_layout = link_fields(
            &mut fields[instance_start as usize..],
            inherited.size,
            inherited,
        );

        let link = ClassLink {
            methods: lc.methods,
            virtual_start: lc.virtual_start,
            copied_start: lc.copied_start,
            vtable: lc.vtable,
            iftable: lc.iftable,
            imtable,
            fields,
            instance_start,
            instance_layout,
            static_layout,
        };
        if class.link.set(link).is_err() {
            return link_err!(VerifyError, "class {} linked twice", class.descriptor);
        }
        Ok(())
    }

    fn make_method(raw: &RawMethod, in_interface: bool) -> Method {
        let mut access_flags = raw.access_flags;
        if in_interface
            && access_flags & (crate::file::ACC_ABSTRACT | ACC_STATIC | crate::file::ACC_PRIVATE)
                == 0
        {
            access_flags |= ACC_DEFAULT;
        }
        Method {
            name: raw.name.as_str().into(),
            signature: raw.signature.as_str().into(),
            access_flags,
            code_off: raw.code_off,
            method_index: 0,
        }
    }

    fn make_field(raw: &RawField) -> Field {
        Field {
            name: raw.name.as_str().into(),
            descriptor: raw.descriptor.as_str().into(),
            access_flags: raw.access_flags,
            offset: 0,
        }
    }

    fn transition(&self, class: &Arc<Class>, next: ClassStatus) {
        let mut state = class.state.lock().unwrap();
        debug_assert!(
            state.status.can_transition_to(next),
            "illegal transition {:?} -> {:?} for {}",
            state.status,
            next,
            class.descriptor
        );
        state.status = next;
    }

    /// Blocks until `id` is resolved; re-throws a cached failure. A class
    /// currently being resolved by this same thread is a circularity.
    fn wait_for_resolution(&self, id: ClassId) -> LinkResult<ClassId> {
        let class = self.arena.get(id);
        let me: ThreadId = std::thread::current().id();
        let mut state = class.state.lock().unwrap();
        loop {
            if state.status.is_erroneous() {
                return Err(Self::earlier_failure(&class, state.cause.as_ref()));
            }
            if state.status.is_resolved() {
                return Ok(id);
            }
            if state.owner == Some(me) {
                return link_err!(ClassCircularity, "{}", class.descriptor);
            }
            state = class.monitor.wait(state).unwrap();
        }
    }

    /// The cached failure for an erroneous class; linking is never retried.
    fn earlier_failure(class: &Class, cause: Option<&LinkError>) -> LinkError {
        match cause {
            Some(cause) => cause.clone(),
            None => LinkError::NoClassDefFound(class.descriptor.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // initialization
    // ------------------------------------------------------------------

    /// Drives a resolved class to `Initialized`, running superclass
    /// initialization first and the injected initializer hook for the class
    /// itself. Re-entry from the thread already initializing the class
    /// returns immediately; other threads wait. Failures are cached.
    pub fn ensure_initialized(&self, id: ClassId) -> LinkResult<()> {
        let class = self.arena.get(id);
        let me = std::thread::current().id();
        {
            let mut state = class.state.lock().unwrap();
            loop {
                match state.status {
                    ClassStatus::Initialized => return Ok(()),
                    _ if state.status.is_erroneous() => {
                        return Err(Self::earlier_failure(&class, state.cause.as_ref()));
                    }
                    ClassStatus::Initializing => {
                        if state.owner == Some(me) {
                            // recursive use during our own <clinit>
                            return Ok(());
                        }
                        state = class.monitor.wait(state).unwrap();
                    }
                    ClassStatus::Resolved => {
                        // no bytecode verifier in this layer; the class
                        // passes through the verifying states unchanged
                        state.status = ClassStatus::Verifying;
                        state.status = ClassStatus::Verified;
                    }
                    ClassStatus::Verified | ClassStatus::RetryVerificationAtRuntime => {
                        state.status = ClassStatus::Initializing;
                        state.owner = Some(me);
                        break;
                    }
                    _ => {
                        state = class.monitor.wait(state).unwrap();
                    }
                }
            }
        }

        let result = self.run_initializer(&class);

        let mut state = class.state.lock().unwrap();
        match &result {
            Ok(()) => {
                state.status = ClassStatus::Initialized;
            }
            Err(cause) => {
                state.status = ClassStatus::ErrorResolved;
                state.cause = Some(cause.clone());
            }
        }
        state.owner = None;
        drop(state);
        class.monitor.notify_all();
        result
    }

    fn run_initializer(&self, class: &Arc<Class>) -> LinkResult<()> {
        if let Some(super_id) = class.superclass() {
            self.ensure_initialized(super_id).map_err(|err| {
                LinkError::NoClassDefFound(format!(
                    "could not initialize superclass of {}: {}",
                    class.descriptor, err
                ))
            })?;
        }
        if let Some(hook) = &self.initializer {
            hook(self, class.id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // consumer surface
    // ------------------------------------------------------------------

    pub fn method_info(&self, m: MethodRef) -> Option<MethodInfo> {
        let class = self.arena.get(m.class);
        let method = class.method(m.index)?;
        Some(MethodInfo {
            name: method.name.clone(),
            signature: method.signature.clone(),
            access_flags: method.access_flags,
        })
    }

    pub fn vtable_len(&self, class: ClassId) -> usize {
        self.arena
            .get(class)
            .link()
            .map(|l| l.vtable.len())
            .unwrap_or(0)
    }

    pub fn vtable_entry(&self, class: ClassId, slot: u16) -> Option<MethodRef> {
        self.arena
            .get(class)
            .link()
            .and_then(|l| l.vtable.get(slot as usize).copied())
    }

    /// The vtable slot declared or inherited for `name`/`signature`.
    pub fn find_virtual_method(
        &self,
        class: ClassId,
        name: &str,
        signature: &str,
    ) -> Option<(u16, MethodRef)> {
        let class = self.arena.get(class);
        let link = class.link()?;
        for (slot, target) in link.vtable.iter().enumerate() {
            let info = self.method_info(*target)?;
            if &*info.name == name && &*info.signature == signature {
                return Some((slot as u16, *target));
            }
        }
        None
    }

    /// Virtual dispatch: the implementation a `invoke-virtual` through
    /// `slot` lands on for an instance of `class`. Sentinel slots raise the
    /// deferred Java-level errors.
    pub fn resolve_virtual(&self, class: ClassId, slot: u16) -> LinkResult<MethodRef> {
        let holder = self.arena.get(class);
        let Some(target) = holder.link().and_then(|l| l.vtable.get(slot as usize).copied())
        else {
            return link_err!(
                NoClassDefFound,
                "no vtable slot {} in {}",
                slot,
                holder.descriptor
            );
        };
        self.check_invocable(target)
    }

    /// Interface dispatch: imtable slot, conflict table, then iftable walk.
    pub fn find_method_for_interface(
        &self,
        class: ClassId,
        interface_method: MethodRef,
    ) -> LinkResult<MethodRef> {
        let holder = self.arena.get(class);
        let info = self
            .method_info(interface_method)
            .ok_or_else(|| LinkError::NoClassDefFound("unresolved interface method".to_string()))?;

        if let Some(link) = holder.link() {
            if let Some(imt) = &link.imtable {
                match imt.get(ImTable::imt_index(&info.name, &info.signature)) {
                    ImtSlot::Single {
                        interface_method: im,
                        implementation,
                    } if im == interface_method => {
                        return self.check_invocable(implementation);
                    }
                    ImtSlot::Conflict(table) => {
                        if let Some(implementation) = table.lookup(interface_method) {
                            return self.check_invocable(implementation);
                        }
                    }
                    _ => {}
                }
            }

            // slow path: the interface's entry in the iftable
            let iface = self.arena.get(interface_method.class);
            let iface_link = iface
                .link()
                .ok_or_else(|| LinkError::NoClassDefFound(iface.descriptor.to_string()))?;
            for entry in &link.iftable {
                if entry.interface != interface_method.class {
                    continue;
                }
                let j = interface_method.index.checked_sub(iface_link.virtual_start);
                if let Some(j) = j {
                    if let Some(implementation) = entry.methods.get(j as usize) {
                        return self.check_invocable(*implementation);
                    }
                }
            }
        }
        link_err!(
            IncompatibleClassChange,
            "class {} does not implement interface {}",
            holder.descriptor,
            self.arena.get(interface_method.class).descriptor
        )
    }

    /// Rejects the sentinel methods with their deferred exceptions.
    fn check_invocable(&self, m: MethodRef) -> LinkResult<MethodRef> {
        let class = self.arena.get(m.class);
        let method = class
            .method(m.index)
            .ok_or_else(|| LinkError::NoClassDefFound(class.descriptor.to_string()))?;
        if method.is_default_conflicting() {
            return link_err!(
                IncompatibleClassChange,
                "conflicting default method implementations for {}{}",
                method.name,
                method.signature
            );
        }
        if method.is_abstract() {
            return link_err!(
                AbstractMethod,
                "abstract method {}{} invoked on {}",
                method.name,
                method.signature,
                class.descriptor
            );
        }
        Ok(m)
    }

    /// The GC-facing reference bitmap for instances of `class` (or the
    /// walk-super sentinel).
    pub fn reference_offsets(&self, class: ClassId) -> Option<u32> {
        self.arena
            .get(class)
            .link()
            .map(|l| l.instance_layout.reference_offsets)
    }

    pub fn instance_size(&self, class: ClassId) -> Option<u32> {
        self.arena.get(class).link().map(|l| l.instance_layout.size)
    }

    pub fn instance_field_offset(&self, class: ClassId, name: &str) -> Option<u32> {
        self.arena.get(class).link().and_then(|l| {
            l.instance_fields()
                .iter()
                .find(|f| &*f.name == name)
                .map(|f| f.offset)
        })
    }

    // ------------------------------------------------------------------
    // dex bridge
    // ------------------------------------------------------------------

    /// Decodes one class definition of a verified dex file into the raw
    /// form the linker consumes.
    fn raw_class_from_dex(&self, dex: &'d DexFile<'d, C>, class_def_idx: u32) -> LinkResult<RawClass> {
        let fail = |err: crate::error::DexError| LinkError::ClassFormat(err.to_string());

        let class_def = dex.get_class_def(class_def_idx).map_err(fail)?;
        let descriptor = dex.get_class_desc(class_def).map_err(fail)?;
        let superclass = if class_def.superclass_idx != NO_INDEX16 {
            Some(dex.get_type_desc_at(class_def.superclass_idx).map_err(fail)?)
        } else {
            None
        };

        let mut interfaces = Vec::new();
        if let Some(list) = dex.get_interfaces_list(class_def).map_err(fail)? {
            for item in list {
                interfaces.push(dex.get_type_desc_at(item.type_idx).map_err(fail)?);
            }
        }

        let mut raw = RawClass {
            descriptor,
            access_flags: class_def.access_flags,
            superclass,
            interfaces,
            ..RawClass::default()
        };

        if let Some(accessor) = dex.get_class_accessor(class_def).map_err(fail)? {
            let raw_field = |field: &crate::file::Field<'d, C>| -> crate::Result<RawField> {
                let field_id = field.get_field_id()?;
                Ok(RawField {
                    name: dex.get_field_name(field_id)?,
                    descriptor: dex.get_type_desc_at(field_id.type_idx)?,
                    access_flags: field.access_flags,
                })
            };
            let raw_method = |method: &crate::file::Method<'d, C>| -> crate::Result<RawMethod> {
                let method_id = method.get_method_id()?;
                Ok(RawMethod {
                    name: dex.get_method_name(method_id)?,
                    signature: dex.get_method_signature(method_id)?,
                    access_flags: method.access_flags,
                    code_off: method.code_offset,
                })
            };

            let mut static_fields = Vec::new();
            let mut instance_fields = Vec::new();
            let mut direct_methods = Vec::new();
            let mut virtual_methods = Vec::new();
            accessor
                .visit_fields_and_methods(
                    |f| {
                        static_fields.push(raw_field(f)?);
                        Ok(())
                    },
                    |f| {
                        instance_fields.push(raw_field(f)?);
                        Ok(())
                    },
                    |m| {
                        direct_methods.push(raw_method(m)?);
                        Ok(())
                    },
                    |m| {
                        virtual_methods.push(raw_method(m)?);
                        Ok(())
                    },
                )
                .map_err(fail)?;
            raw.static_fields = static_fields;
            raw.instance_fields = instance_fields;
            raw.direct_methods = direct_methods;
            raw.virtual_methods = virtual_methods;
        }
        Ok(raw)
    }
}
