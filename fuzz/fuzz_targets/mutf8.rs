#![no_main]

use dexlink::utf;

libfuzzer_sys::fuzz_target!(|data: &[u8]| {
    // end must be a zero
    if let Some(end) = data.iter().position(|&x| x == 0) {
        let body = &data[..end];
        let declared = utf::mutf8_len(data, end) as u32;
        if utf::check_mutf8(body, declared, 0).is_ok() {
            let _ = utf::mutf8_to_str(&data[..end + 1]);
        }
    }
});
