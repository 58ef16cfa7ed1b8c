use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::LinkError;
use crate::file::testing::{DexBuilder, TestClass, TestMethod};
use crate::file::verifier::VerifyPreset;
use crate::file::{
    DexFile, DexLocation, InMemoryDexContainer, ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC,
};

use super::class::{ClassId, ClassStatus, MethodRef, RawClass, RawField, RawMethod};
use super::fields::CLASS_WALK_SUPER;
use super::ClassLinker;

const OBJECT: &str = "Ljava/lang/Object;";

type RawLinker = ClassLinker<'static, &'static [u8]>;

fn linker() -> RawLinker {
    let linker = ClassLinker::new();
    linker.bootstrap().unwrap();
    linker
}

fn vmethod(name: &str, code_off: u32) -> RawMethod {
    RawMethod {
        name: name.to_string(),
        signature: "()V".to_string(),
        access_flags: ACC_PUBLIC,
        code_off,
    }
}

fn amethod(name: &str) -> RawMethod {
    RawMethod {
        name: name.to_string(),
        signature: "()V".to_string(),
        access_flags: ACC_PUBLIC | ACC_ABSTRACT,
        code_off: 0,
    }
}

fn iface(descriptor: &str, extends: &[&str], methods: Vec<RawMethod>) -> RawClass {
    RawClass {
        descriptor: descriptor.to_string(),
        access_flags: ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT,
        superclass: Some(OBJECT.to_string()),
        interfaces: extends.iter().map(|s| s.to_string()).collect(),
        virtual_methods: methods,
        ..RawClass::default()
    }
}

fn klass(
    descriptor: &str,
    superclass: Option<&str>,
    interfaces: &[&str],
    methods: Vec<RawMethod>,
) -> RawClass {
    RawClass {
        descriptor: descriptor.to_string(),
        access_flags: ACC_PUBLIC,
        superclass: Some(superclass.unwrap_or(OBJECT).to_string()),
        interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        virtual_methods: methods,
        ..RawClass::default()
    }
}

/// Handle to a named method declared by an interface.
fn iface_method(linker: &RawLinker, iface: ClassId, name: &str) -> MethodRef {
    let class = linker.get_class(iface);
    let link = class.link().unwrap();
    let j = link
        .declared_virtual_methods()
        .iter()
        .position(|m| &*m.name == name)
        .unwrap();
    MethodRef {
        class: iface,
        index: link.virtual_start + j as u16,
    }
}

fn code_off_of(linker: &RawLinker, m: MethodRef) -> u32 {
    let class = linker.get_class(m.class);
    class.link().unwrap().methods[m.index as usize].code_off
}

// ----------------------------------------------------------------------
// vtable construction
// ----------------------------------------------------------------------

#[test]
fn test_override_keeps_slot_and_subclass_inherits_it() {
    let linker = linker();
    let a = linker
        .define_raw_class(&klass("LA;", None, &[], vec![vmethod("m", 100)]))
        .unwrap();
    let b = linker
        .define_raw_class(&klass("LB;", Some("LA;"), &[], vec![vmethod("m", 200)]))
        .unwrap();
    let c = linker
        .define_raw_class(&klass("LC;", Some("LB;"), &[], vec![]))
        .unwrap();

    let (slot_a, _) = linker.find_virtual_method(a, "m", "()V").unwrap();
    let (slot_b, impl_b) = linker.find_virtual_method(b, "m", "()V").unwrap();
    let (slot_c, impl_c) = linker.find_virtual_method(c, "m", "()V").unwrap();

    // the slot assigned by A is stable down the hierarchy
    assert_eq!(slot_a, slot_b);
    assert_eq!(slot_a, slot_c);
    // B overrides; C inherits B's implementation, not A's
    assert_eq!(impl_b.class, b);
    assert_eq!(impl_c.class, b);
    assert_eq!(code_off_of(&linker, impl_c), 200);
    // A's own table is untouched by the subclass override
    let impl_a = linker.vtable_entry(a, slot_a).unwrap();
    assert_eq!(impl_a.class, a);
}

#[test]
fn test_new_virtual_methods_append_slots() {
    let linker = linker();
    let a = linker
        .define_raw_class(&klass("LA;", None, &[], vec![vmethod("m", 100)]))
        .unwrap();
    let b = linker
        .define_raw_class(&klass(
            "LB;",
            Some("LA;"),
            &[],
            vec![vmethod("n", 200), vmethod("m", 300)],
        ))
        .unwrap();

    assert_eq!(linker.vtable_len(a), 1);
    assert_eq!(linker.vtable_len(b), 2);
    let (slot_m, _) = linker.find_virtual_method(b, "m", "()V").unwrap();
    let (slot_n, _) = linker.find_virtual_method(b, "n", "()V").unwrap();
    assert_eq!(slot_m, 0);
    assert_eq!(slot_n, 1);
}

#[test]
fn test_overriding_final_method_fails() {
    let linker = linker();
    let mut base = klass("LBase;", None, &[], vec![vmethod("m", 100)]);
    base.virtual_methods[0].access_flags |= crate::file::ACC_FINAL;
    linker.define_raw_class(&base).unwrap();

    let err = linker
        .define_raw_class(&klass("LSub;", Some("LBase;"), &[], vec![vmethod("m", 200)]))
        .unwrap_err();
    assert!(matches!(err, LinkError::VerifyError(_)), "{err}");
}

// ----------------------------------------------------------------------
// interface linking
// ----------------------------------------------------------------------

#[test]
fn test_single_default_method_is_used() {
    let linker = linker();
    let i1 = linker
        .define_raw_class(&iface("LI1;", &[], vec![vmethod("d", 100)]))
        .unwrap();
    let d = linker
        .define_raw_class(&klass("LD;", None, &["LI1;"], vec![]))
        .unwrap();

    let im = iface_method(&linker, i1, "d");
    let implementation = linker.find_method_for_interface(d, im).unwrap();
    // the default is copied into the class, carrying the interface's code
    assert_eq!(implementation.class, d);
    assert_eq!(code_off_of(&linker, implementation), 100);

    let class = linker.get_class(d);
    assert_eq!(class.link().unwrap().copied_methods().len(), 1);

    let (slot, _) = linker.find_virtual_method(d, "d", "()V").unwrap();
    linker.resolve_virtual(d, slot).unwrap();
}

#[test]
fn test_unrelated_default_methods_conflict() {
    let linker = linker();
    let i1 = linker
        .define_raw_class(&iface("LI1;", &[], vec![vmethod("d", 100)]))
        .unwrap();
    let _i2 = linker
        .define_raw_class(&iface("LI2;", &[], vec![vmethod("d", 200)]))
        .unwrap();
    let d = linker
        .define_raw_class(&klass("LD;", None, &["LI1;", "LI2;"], vec![]))
        .unwrap();

    // the slot exists but is a conflict sentinel
    let (slot, _) = linker.find_virtual_method(d, "d", "()V").unwrap();
    let err = linker.resolve_virtual(d, slot).unwrap_err();
    assert!(matches!(err, LinkError::IncompatibleClassChange(_)), "{err}");

    let im = iface_method(&linker, i1, "d");
    let err = linker.find_method_for_interface(d, im).unwrap_err();
    assert!(matches!(err, LinkError::IncompatibleClassChange(_)), "{err}");
}

#[test]
fn test_abstract_interface_method_stays_miranda() {
    let linker = linker();
    let i = linker
        .define_raw_class(&iface("LI;", &[], vec![amethod("a")]))
        .unwrap();
    let mut raw = klass("LE;", None, &["LI;"], vec![]);
    raw.access_flags |= ACC_ABSTRACT;
    let e = linker.define_raw_class(&raw).unwrap();

    // the miranda slot exists so subclasses can override it
    let (slot, target) = linker.find_virtual_method(e, "a", "()V").unwrap();
    let class = linker.get_class(e);
    let link = class.link().unwrap();
    assert!(link.methods[target.index as usize].is_miranda());

    let err = linker.resolve_virtual(e, slot).unwrap_err();
    assert!(matches!(err, LinkError::AbstractMethod(_)), "{err}");

    let im = iface_method(&linker, i, "a");
    let err = linker.find_method_for_interface(e, im).unwrap_err();
    assert!(matches!(err, LinkError::AbstractMethod(_)), "{err}");
}

#[test]
fn test_class_method_beats_default() {
    let linker = linker();
    let i1 = linker
        .define_raw_class(&iface("LI1;", &[], vec![vmethod("d", 100)]))
        .unwrap();
    let c = linker
        .define_raw_class(&klass("LC;", None, &["LI1;"], vec![vmethod("d", 500)]))
        .unwrap();

    let im = iface_method(&linker, i1, "d");
    let implementation = linker.find_method_for_interface(c, im).unwrap();
    assert_eq!(implementation.class, c);
    assert_eq!(code_off_of(&linker, implementation), 500);
    // nothing needed to be copied
    let class = linker.get_class(c);
    assert!(class.link().unwrap().copied_methods().is_empty());
}

#[test]
fn test_superclass_method_satisfies_interface() {
    let linker = linker();
    linker
        .define_raw_class(&klass("LA;", None, &[], vec![vmethod("m", 100)]))
        .unwrap();
    let i = linker
        .define_raw_class(&iface("LI;", &[], vec![amethod("m")]))
        .unwrap();
    let b = linker
        .define_raw_class(&klass("LB;", Some("LA;"), &["LI;"], vec![]))
        .unwrap();

    let im = iface_method(&linker, i, "m");
    let implementation = linker.find_method_for_interface(b, im).unwrap();
    assert_eq!(code_off_of(&linker, implementation), 100);
}

#[test]
fn test_sub_interface_default_shadows_super_default() {
    let linker = linker();
    let ibase = linker
        .define_raw_class(&iface("LIBase;", &[], vec![vmethod("d", 100)]))
        .unwrap();
    let isub = linker
        .define_raw_class(&iface("LISub;", &["LIBase;"], vec![vmethod("d", 200)]))
        .unwrap();
    let d = linker
        .define_raw_class(&klass("LD;", None, &["LIBase;", "LISub;"], vec![]))
        .unwrap();

    // the more specific interface wins; no conflict
    for im_holder in [ibase, isub] {
        let im = iface_method(&linker, im_holder, "d");
        let implementation = linker.find_method_for_interface(d, im).unwrap();
        assert_eq!(code_off_of(&linker, implementation), 200);
    }
}

#[test]
fn test_common_ancestor_default_does_not_disambiguate() {
    // I1 and I2 both extend IBase and both re-declare d() as a default;
    // IBase's own default is masked by both, leaving two unrelated
    // candidates
    let linker = linker();
    linker
        .define_raw_class(&iface("LIBase;", &[], vec![vmethod("d", 100)]))
        .unwrap();
    linker
        .define_raw_class(&iface("LI1;", &["LIBase;"], vec![vmethod("d", 200)]))
        .unwrap();
    linker
        .define_raw_class(&iface("LI2;", &["LIBase;"], vec![vmethod("d", 300)]))
        .unwrap();
    let d = linker
        .define_raw_class(&klass("LD;", None, &["LI1;", "LI2;"], vec![]))
        .unwrap();

    let (slot, _) = linker.find_virtual_method(d, "d", "()V").unwrap();
    let err = linker.resolve_virtual(d, slot).unwrap_err();
    assert!(matches!(err, LinkError::IncompatibleClassChange(_)), "{err}");
}

#[test]
fn test_subclass_gains_default_for_inherited_miranda() {
    let linker = linker();
    linker
        .define_raw_class(&iface("LI;", &[], vec![amethod("a")]))
        .unwrap();
    let mut abstract_a = klass("LA;", None, &["LI;"], vec![]);
    abstract_a.access_flags |= ACC_ABSTRACT;
    let a = linker.define_raw_class(&abstract_a).unwrap();

    linker
        .define_raw_class(&iface("LJ;", &["LI;"], vec![vmethod("a", 700)]))
        .unwrap();
    let b = linker
        .define_raw_class(&klass("LB;", Some("LA;"), &["LJ;"], vec![]))
        .unwrap();

    let (slot, _) = linker.find_virtual_method(b, "a", "()V").unwrap();
    let implementation = linker.resolve_virtual(b, slot).unwrap();
    assert_eq!(code_off_of(&linker, implementation), 700);

    // the abstract superclass still sees the miranda
    let err = linker.resolve_virtual(a, slot).unwrap_err();
    assert!(matches!(err, LinkError::AbstractMethod(_)), "{err}");
}

#[test]
fn test_imtable_collisions_resolve_through_conflict_tables() {
    let linker = linker();
    // more default methods than imtable slots forces at least one
    // conflict table
    let methods: Vec<RawMethod> = (0..super::IMT_SIZE + 1)
        .map(|i| vmethod(&format!("m{i}"), 1000 + i as u32))
        .collect();
    let i = linker
        .define_raw_class(&iface("LBig;", &[], methods))
        .unwrap();
    let d = linker
        .define_raw_class(&klass("LD;", None, &["LBig;"], vec![]))
        .unwrap();

    for k in 0..super::IMT_SIZE + 1 {
        let name = format!("m{k}");
        let im = iface_method(&linker, i, &name);
        let implementation = linker.find_method_for_interface(d, im).unwrap();
        assert_eq!(code_off_of(&linker, implementation), 1000 + k as u32);
    }
}

// ----------------------------------------------------------------------
// failure caching and circularity
// ----------------------------------------------------------------------

#[test]
fn test_link_failure_is_cached() {
    let linker = linker();
    let err = linker
        .define_raw_class(&klass("LBroken;", Some("LNope;"), &[], vec![]))
        .unwrap_err();
    assert!(matches!(err, LinkError::NoClassDefFound(_)), "{err}");

    // the class stays erroneous and re-throws without retrying
    let again = linker.find_class("LBroken;").unwrap_err();
    assert_eq!(err, again);

    // sibling classes are unaffected
    linker
        .define_raw_class(&klass("LFine;", None, &[], vec![]))
        .unwrap();
}

#[test]
fn test_subclass_of_erroneous_class_is_erroneous() {
    let linker = linker();
    linker
        .define_raw_class(&klass("LBroken;", Some("LNope;"), &[], vec![]))
        .unwrap_err();
    let err = linker
        .define_raw_class(&klass("LChild;", Some("LBroken;"), &[], vec![]))
        .unwrap_err();
    assert!(matches!(err, LinkError::NoClassDefFound(_)), "{err}");
}

#[test]
fn test_superclass_circularity_across_dex_files() {
    let bytes1 = DexBuilder::new()
        .add_class(TestClass {
            descriptor: "LA;".to_string(),
            superclass: Some("LB;".to_string()),
            access_flags: ACC_PUBLIC,
            virtual_methods: Vec::new(),
        })
        .build();
    let bytes2 = DexBuilder::new()
        .add_class(TestClass {
            descriptor: "LB;".to_string(),
            superclass: Some("LA;".to_string()),
            access_flags: ACC_PUBLIC,
            virtual_methods: Vec::new(),
        })
        .build();

    let container1 = InMemoryDexContainer::new(&bytes1);
    let container2 = InMemoryDexContainer::new(&bytes2);
    let dex1 = DexFile::open(&container1, DexLocation::InMemory, VerifyPreset::All).unwrap();
    let dex2 = DexFile::open(&container2, DexLocation::InMemory, VerifyPreset::All).unwrap();

    let mut linker: ClassLinker<'_, InMemoryDexContainer<'_>> = ClassLinker::new();
    linker.register_dex(&dex1).unwrap();
    linker.register_dex(&dex2).unwrap();

    let err = linker.find_class("LA;").unwrap_err();
    assert!(
        matches!(err, LinkError::ClassCircularity(_) | LinkError::NoClassDefFound(_)),
        "{err}"
    );
}

// ----------------------------------------------------------------------
// initialization
// ----------------------------------------------------------------------

#[test]
fn test_initializer_runs_once_superclass_first() {
    let order: &'static Mutex<Vec<String>> = Box::leak(Box::new(Mutex::new(Vec::new())));
    let mut linker: RawLinker = ClassLinker::new();
    linker.set_initializer(move |l, id| {
        order
            .lock()
            .unwrap()
            .push(l.get_class(id).descriptor.to_string());
        Ok(())
    });
    linker.bootstrap().unwrap();

    let a = linker
        .define_raw_class(&klass("LA;", None, &[], vec![]))
        .unwrap();
    let b = linker
        .define_raw_class(&klass("LB;", Some("LA;"), &[], vec![]))
        .unwrap();

    linker.ensure_initialized(b).unwrap();
    linker.ensure_initialized(b).unwrap();
    linker.ensure_initialized(a).unwrap();

    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, vec![OBJECT.to_string(), "LA;".to_string(), "LB;".to_string()]);
    assert_eq!(linker.class_status(b), ClassStatus::Initialized);
}

#[test]
fn test_reentrant_initialization_is_allowed() {
    let depth: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
    let mut linker: RawLinker = ClassLinker::new();
    linker.set_initializer(move |l, id| {
        if depth.fetch_add(1, Ordering::SeqCst) > 3 {
            return Ok(());
        }
        // same-thread re-entry must observe the class as initialized
        l.ensure_initialized(id)
    });
    linker.bootstrap().unwrap();
    let a = linker
        .define_raw_class(&klass("LA;", None, &[], vec![]))
        .unwrap();
    linker.ensure_initialized(a).unwrap();
    assert_eq!(linker.class_status(a), ClassStatus::Initialized);
}

#[test]
fn test_failed_initialization_is_cached() {
    let runs: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
    let mut linker: RawLinker = ClassLinker::new();
    linker.set_initializer(move |l, id| {
        if &*l.get_class(id).descriptor == "LBad;" {
            runs.fetch_add(1, Ordering::SeqCst);
            return Err(LinkError::VerifyError("boom".to_string()));
        }
        Ok(())
    });
    linker.bootstrap().unwrap();
    let bad = linker
        .define_raw_class(&klass("LBad;", None, &[], vec![]))
        .unwrap();

    assert!(linker.ensure_initialized(bad).is_err());
    assert!(linker.ensure_initialized(bad).is_err());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(linker.class_status(bad), ClassStatus::ErrorResolved);
}

// ----------------------------------------------------------------------
// concurrency
// ----------------------------------------------------------------------

#[test]
fn test_concurrent_definition_of_same_class() {
    let linker = linker();
    linker
        .define_raw_class(&klass("LA;", None, &[], vec![vmethod("m", 100)]))
        .unwrap();

    let raw = klass("LC;", Some("LA;"), &[], vec![vmethod("m", 200)]);
    let ids: Vec<ClassId> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let linker = &linker;
                let raw = &raw;
                scope.spawn(move || linker.define_raw_class(raw).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // every thread observed the same winning definition
    let first = ids[0];
    assert!(ids.iter().all(|id| *id == first));
    assert_eq!(linker.class_status(first), ClassStatus::Resolved);
    let (_, implementation) = linker.find_virtual_method(first, "m", "()V").unwrap();
    assert_eq!(implementation.class, first);
}

#[test]
fn test_concurrent_initialization_waits() {
    let runs: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
    let mut linker: RawLinker = ClassLinker::new();
    linker.set_initializer(move |_, _| {
        runs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(10));
        Ok(())
    });
    linker.bootstrap().unwrap();
    let a = linker
        .define_raw_class(&klass("LA;", None, &[], vec![]))
        .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let linker = &linker;
            scope.spawn(move || linker.ensure_initialized(a).unwrap());
        }
    });
    // Object + LA;, each exactly once
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

// ----------------------------------------------------------------------
// field layout through the linker
// ----------------------------------------------------------------------

#[test]
fn test_instance_fields_extend_superclass_layout() {
    let linker = linker();
    let base = RawClass {
        descriptor: "LBase;".to_string(),
        access_flags: ACC_PUBLIC,
        superclass: Some(OBJECT.to_string()),
        instance_fields: vec![
            RawField {
                name: "ref".to_string(),
                descriptor: "Ljava/lang/Object;".to_string(),
                access_flags: ACC_PUBLIC,
            },
            RawField {
                name: "count".to_string(),
                descriptor: "I".to_string(),
                access_flags: ACC_PUBLIC,
            },
        ],
        ..RawClass::default()
    };
    let base_id = linker.define_raw_class(&base).unwrap();
    let base_size = linker.instance_size(base_id).unwrap();
    assert!(base_size >= 16);

    let sub = RawClass {
        descriptor: "LSub;".to_string(),
        access_flags: ACC_PUBLIC,
        superclass: Some("LBase;".to_string()),
        instance_fields: vec![RawField {
            name: "extra".to_string(),
            descriptor: "Ljava/lang/Object;".to_string(),
            access_flags: ACC_PUBLIC,
        }],
        ..RawClass::default()
    };
    let sub_id = linker.define_raw_class(&sub).unwrap();

    // subclass fields land after the superclass layout
    let extra_off = linker.instance_field_offset(sub_id, "extra").unwrap();
    assert!(extra_off >= base_size);

    // the subclass bitmap includes the inherited reference word
    let base_refs = linker.reference_offsets(base_id).unwrap();
    let sub_refs = linker.reference_offsets(sub_id).unwrap();
    assert_ne!(base_refs, CLASS_WALK_SUPER);
    assert_eq!(sub_refs & base_refs, base_refs);
    assert!(sub_refs.count_ones() > base_refs.count_ones());
}

// ----------------------------------------------------------------------
// dex bridge
// ----------------------------------------------------------------------

#[test]
fn test_classes_load_from_verified_dex() {
    let bytes = DexBuilder::new()
        .add_class(TestClass {
            descriptor: "LWorker;".to_string(),
            superclass: None,
            access_flags: ACC_PUBLIC,
            virtual_methods: vec![TestMethod::concrete("run"), TestMethod::concrete("stop")],
        })
        .build();
    let container = InMemoryDexContainer::new(&bytes);
    let dex = DexFile::open(&container, DexLocation::InMemory, VerifyPreset::All).unwrap();

    let mut linker: ClassLinker<'_, InMemoryDexContainer<'_>> = ClassLinker::new();
    linker.register_dex(&dex).unwrap();

    let worker = linker.find_class("LWorker;").unwrap();
    assert_eq!(linker.class_status(worker), ClassStatus::Resolved);
    assert_eq!(linker.vtable_len(worker), 2);
    let (slot, _) = linker.find_virtual_method(worker, "run", "()V").unwrap();
    linker.resolve_virtual(worker, slot).unwrap();

    // second lookup hits the class table, not the dex
    assert_eq!(linker.find_class("LWorker;").unwrap(), worker);
    // unknown classes fail with the Java-level error
    let err = linker.find_class("LMissing;").unwrap_err();
    assert!(matches!(err, LinkError::NoClassDefFound(_)), "{err}");
}
