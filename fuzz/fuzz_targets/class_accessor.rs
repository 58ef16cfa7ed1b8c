#![no_main]

use dexlink::file::{ClassAccessor, DexFile, DexLocation};

libfuzzer_sys::fuzz_target!(|data: &[u8]| {
    let Ok(dex) = DexFile::from_raw_parts(&data, DexLocation::InMemory) else {
        return;
    };
    let Ok(accessor) = ClassAccessor::from_raw(&dex, data) else {
        return;
    };
    let _ = accessor.visit_fields_and_methods(
        |_| Ok(()),
        |_| Ok(()),
        |_| Ok(()),
        |_| Ok(()),
    );
});
