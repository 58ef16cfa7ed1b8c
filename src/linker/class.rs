//! The linked class model: arena-addressed classes, their method arrays and
//! dispatch tables, and the per-class status state machine.

use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread::ThreadId;

use crate::error::LinkError;
use crate::file::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PRIVATE, ACC_STATIC};

use super::fields::FieldLayout;
use super::imtable::ImTable;

/// Stable handle to a class in the arena. Classes are never deallocated
/// while the linker lives, so a `ClassId` can be stored freely where the
/// original runtime held raw `Class*` pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Handle to a method slot: the owning class plus the index into its method
/// array (direct, virtual and copied methods share one array).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub class: ClassId,
    pub index: u16,
}

// Runtime-internal method flags, disjoint from the dex access flags.
pub const ACC_COPIED: u32 = 0x0010_0000;
pub const ACC_MIRANDA: u32 = 0x0020_0000;
pub const ACC_DEFAULT: u32 = 0x0040_0000;
pub const ACC_DEFAULT_CONFLICT: u32 = 0x0100_0000;

#[derive(Debug, Clone)]
pub struct Method {
    pub name: Arc<str>,
    pub signature: Arc<str>,
    pub access_flags: u32,
    /// dex code item offset; 0 for abstract methods and sentinels
    pub code_off: u32,
    /// vtable slot for virtual methods of a class; declaration order for
    /// interface methods
    pub method_index: u16,
}

impl Method {
    #[inline]
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        self.access_flags & ACC_PRIVATE != 0
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    #[inline]
    pub fn is_copied(&self) -> bool {
        self.access_flags & ACC_COPIED != 0
    }

    #[inline]
    pub fn is_miranda(&self) -> bool {
        self.access_flags & ACC_MIRANDA != 0
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        self.access_flags & ACC_DEFAULT != 0
    }

    #[inline]
    pub fn is_default_conflicting(&self) -> bool {
        self.access_flags & ACC_DEFAULT_CONFLICT != 0
    }

    /// Whether this method can satisfy an interface slot by itself.
    #[inline]
    pub fn is_invocable(&self) -> bool {
        !self.is_abstract() && !self.is_default_conflicting()
    }

    #[inline]
    pub fn same_name_and_signature(&self, other: &Method) -> bool {
        self.name == other.name && self.signature == other.signature
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: Arc<str>,
    pub descriptor: Arc<str>,
    pub access_flags: u32,
    /// byte offset from object base (instance) or storage base (static);
    /// assigned by field linking
    pub offset: u32,
}

impl Field {
    #[inline]
    pub fn is_reference(&self) -> bool {
        matches!(self.descriptor.as_bytes().first(), Some(b'L') | Some(b'['))
    }

    /// Storage size in bytes.
    pub fn size(&self) -> u32 {
        match self.descriptor.as_bytes().first() {
            Some(b'J') | Some(b'D') => 8,
            Some(b'I') | Some(b'F') | Some(b'L') | Some(b'[') => 4,
            Some(b'S') | Some(b'C') => 2,
            _ => 1, // B, Z
        }
    }
}

/// Class lifecycle. `ErrorUnresolved` absorbs failures before `Resolved`,
/// `ErrorResolved` after; `Retired` marks an entry that lost a concurrent
/// definition race and was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClassStatus {
    NotReady,
    Idx,
    Loaded,
    Resolving,
    Resolved,
    Verifying,
    RetryVerificationAtRuntime,
    Verified,
    Initializing,
    Initialized,
    ErrorResolved,
    ErrorUnresolved,
    Retired,
}

impl ClassStatus {
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            ClassStatus::Resolved
                | ClassStatus::Verifying
                | ClassStatus::RetryVerificationAtRuntime
                | ClassStatus::Verified
                | ClassStatus::Initializing
                | ClassStatus::Initialized
                | ClassStatus::ErrorResolved
        )
    }

    pub fn is_erroneous(self) -> bool {
        matches!(self, ClassStatus::ErrorResolved | ClassStatus::ErrorUnresolved)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClassStatus::Initialized
                | ClassStatus::ErrorResolved
                | ClassStatus::ErrorUnresolved
                | ClassStatus::Retired
        )
    }

    /// Legal transitions of the lifecycle state machine.
    pub fn can_transition_to(self, next: ClassStatus) -> bool {
        use ClassStatus::*;
        match (self, next) {
            (NotReady, Idx) => true,
            (Idx, Loaded) => true,
            (Loaded, Resolving) => true,
            (Resolving, Resolved) => true,
            (Resolving, Retired) => true,
            (Resolved, Verifying) => true,
            (Verifying, Verified) => true,
            (Verifying, RetryVerificationAtRuntime) => true,
            (RetryVerificationAtRuntime, Initializing) => true,
            (Verified, Initializing) => true,
            (Initializing, Initialized) => true,
            (Initializing, ErrorResolved) => true,
            // failures after resolution keep the resolved data
            (Resolved | Verifying | Verified, ErrorResolved) => true,
            // failures before resolution are absorbing
            (NotReady | Idx | Loaded | Resolving, ErrorUnresolved) => true,
            _ => false,
        }
    }
}

pub(crate) struct ClassState {
    pub status: ClassStatus,
    /// thread driving `Resolving` or `Initializing`, for re-entrancy
    /// detection
    pub owner: Option<ThreadId>,
    /// failure cause, re-thrown on every later use of the class
    pub cause: Option<LinkError>,
}

/// One entry of the interface table: an implemented interface plus, for
/// instantiable classes, the concrete implementation of each of its
/// methods (indexed by the interface's method declaration order).
#[derive(Debug, Clone)]
pub struct IfTableEntry {
    pub interface: ClassId,
    pub methods: Vec<MethodRef>,
}

/// The write-once result of linking: method array with its direct/virtual/
/// copied partition, dispatch tables, and field layouts.
pub struct ClassLink {
    pub methods: Vec<Method>,
    /// methods[..virtual_start] are direct, [virtual_start..copied_start]
    /// declared virtual, [copied_start..] copied (mirandas, defaults,
    /// conflict sentinels)
    pub virtual_start: u16,
    pub copied_start: u16,
    pub vtable: Vec<MethodRef>,
    pub iftable: Vec<IfTableEntry>,
    pub imtable: Option<ImTable>,
    pub fields: Vec<Field>,
    /// fields[..instance_start] are static
    pub instance_start: u16,
    pub instance_layout: FieldLayout,
    pub static_layout: FieldLayout,
}

impl ClassLink {
    pub fn direct_methods(&self) -> &[Method] {
        &self.methods[..self.virtual_start as usize]
    }

    pub fn declared_virtual_methods(&self) -> &[Method] {
        &self.methods[self.virtual_start as usize..self.copied_start as usize]
    }

    pub fn copied_methods(&self) -> &[Method] {
        &self.methods[self.copied_start as usize..]
    }

    pub fn static_fields(&self) -> &[Field] {
        &self.fields[..self.instance_start as usize]
    }

    pub fn instance_fields(&self) -> &[Field] {
        &self.fields[self.instance_start as usize..]
    }
}

pub struct Class {
    pub id: ClassId,
    pub descriptor: Arc<str>,
    pub access_flags: u32,
    /// set once the superclass is resolved (the class entry itself is
    /// published before its hierarchy, so cycles can be detected)
    pub(crate) superclass: OnceLock<Option<ClassId>>,
    pub(crate) direct_interfaces: OnceLock<Vec<ClassId>>,

    pub(crate) state: Mutex<ClassState>,
    pub(crate) monitor: Condvar,
    pub(crate) link: OnceLock<ClassLink>,
}

impl Class {
    pub(crate) fn new(id: ClassId, descriptor: Arc<str>, access_flags: u32) -> Self {
        Self {
            id,
            descriptor,
            access_flags,
            superclass: OnceLock::new(),
            direct_interfaces: OnceLock::new(),
            state: Mutex::new(ClassState {
                status: ClassStatus::NotReady,
                owner: None,
                cause: None,
            }),
            monitor: Condvar::new(),
            link: OnceLock::new(),
        }
    }

    pub fn superclass(&self) -> Option<ClassId> {
        self.superclass.get().copied().flatten()
    }

    pub fn direct_interfaces(&self) -> &[ClassId] {
        self.direct_interfaces.get().map(Vec::as_slice).unwrap_or(&[])
    }

    #[inline]
    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    pub fn status(&self) -> ClassStatus {
        self.state.lock().unwrap().status
    }

    /// Linked data; present once the class reached `Resolved`.
    pub fn link(&self) -> Option<&ClassLink> {
        self.link.get()
    }

    pub(crate) fn method(&self, index: u16) -> Option<&Method> {
        self.link().and_then(|l| l.methods.get(index as usize))
    }
}

/// Append-only class storage; ids index into it and stay valid for the
/// lifetime of the linker.
#[derive(Default)]
pub struct ClassArena {
    classes: RwLock<Vec<Arc<Class>>>,
}

impl ClassArena {
    pub fn alloc(&self, descriptor: Arc<str>, access_flags: u32) -> Arc<Class> {
        let mut classes = self.classes.write().unwrap();
        let id = ClassId(classes.len() as u32);
        let class = Arc::new(Class::new(id, descriptor, access_flags));
        classes.push(class.clone());
        class
    }

    pub fn get(&self, id: ClassId) -> Arc<Class> {
        self.classes.read().unwrap()[id.0 as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.classes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Input to the linker: one decoded class, either read out of a verified
/// dex file or constructed directly.
#[derive(Debug, Clone, Default)]
pub struct RawClass {
    pub descriptor: String,
    pub access_flags: u32,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub direct_methods: Vec<RawMethod>,
    pub virtual_methods: Vec<RawMethod>,
    pub static_fields: Vec<RawField>,
    pub instance_fields: Vec<RawField>,
}

#[derive(Debug, Clone)]
pub struct RawMethod {
    pub name: String,
    pub signature: String,
    pub access_flags: u32,
    pub code_off: u32,
}

#[derive(Debug, Clone)]
pub struct RawField {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use ClassStatus::*;
        assert!(NotReady.can_transition_to(Idx));
        assert!(Resolving.can_transition_to(Resolved));
        assert!(Resolving.can_transition_to(Retired));
        assert!(Resolving.can_transition_to(ErrorUnresolved));
        assert!(Initializing.can_transition_to(ErrorResolved));
        assert!(!Resolved.can_transition_to(ErrorUnresolved));
        assert!(!Retired.can_transition_to(Resolved));
        assert!(!Initialized.can_transition_to(Initializing));
    }

    #[test]
    fn test_field_sizes() {
        let field = |descriptor: &str| Field {
            name: "f".into(),
            descriptor: descriptor.into(),
            access_flags: 0,
            offset: 0,
        };
        assert_eq!(field("J").size(), 8);
        assert_eq!(field("D").size(), 8);
        assert_eq!(field("I").size(), 4);
        assert_eq!(field("Ljava/lang/Object;").size(), 4);
        assert_eq!(field("[B").size(), 4);
        assert_eq!(field("S").size(), 2);
        assert_eq!(field("Z").size(), 1);
        assert!(field("[I").is_reference());
        assert!(!field("I").is_reference());
    }
}
