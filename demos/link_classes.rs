use dexlink::file::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC};
use dexlink::linker::class::{RawClass, RawMethod};
use dexlink::linker::ClassLinker;

fn method(name: &str, code_off: u32) -> RawMethod {
    RawMethod {
        name: name.to_string(),
        signature: "()V".to_string(),
        access_flags: ACC_PUBLIC,
        code_off,
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // a small hierarchy: Closeable with a default close(), Stream
    // overriding it, BufferedStream inheriting the override
    let linker: ClassLinker<'static, &'static [u8]> = ClassLinker::new();
    linker.bootstrap()?;

    linker.define_raw_class(&RawClass {
        descriptor: "LCloseable;".to_string(),
        access_flags: ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT,
        superclass: Some("Ljava/lang/Object;".to_string()),
        virtual_methods: vec![method("close", 0x100)],
        ..RawClass::default()
    })?;

    let stream = linker.define_raw_class(&RawClass {
        descriptor: "LStream;".to_string(),
        access_flags: ACC_PUBLIC,
        superclass: Some("Ljava/lang/Object;".to_string()),
        interfaces: vec!["LCloseable;".to_string()],
        virtual_methods: vec![method("close", 0x200), method("read", 0x210)],
        ..RawClass::default()
    })?;

    let buffered = linker.define_raw_class(&RawClass {
        descriptor: "LBufferedStream;".to_string(),
        access_flags: ACC_PUBLIC,
        superclass: Some("LStream;".to_string()),
        virtual_methods: vec![method("read", 0x300)],
        ..RawClass::default()
    })?;

    for id in [stream, buffered] {
        let class = linker.get_class(id);
        println!("{} vtable:", class.descriptor);
        for slot in 0..linker.vtable_len(id) as u16 {
            let target = linker.vtable_entry(id, slot).unwrap();
            let info = linker.method_info(target).unwrap();
            println!(
                "  [{slot}] {}{} -> {}",
                info.name,
                info.signature,
                linker.get_class(target.class).descriptor
            );
        }
    }

    linker.ensure_initialized(buffered)?;
    println!(
        "BufferedStream status: {:?}",
        linker.class_status(buffered)
    );
    Ok(())
}
