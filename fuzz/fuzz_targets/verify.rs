#![no_main]

use dexlink::file::verifier::VerifyPreset;
use dexlink::file::{DexFile, DexLocation};

libfuzzer_sys::fuzz_target!(|data: &[u8]| {
    // this must not panic or read out of bounds on any input
    if let Ok(dex) = DexFile::from_raw_parts(&data, DexLocation::InMemory) {
        let _ = DexFile::verify(&dex, VerifyPreset::All);
    }
});
