#![allow(unused)]

use dexlink::file::{verifier::VerifyPreset, DexFile, DexFileContainer, DexLocation};

fn parse_dex_file(path: &str) -> anyhow::Result<()> {
    // external files should be opened through a DexFileContainer
    let file = std::fs::File::open(path)?;
    // you can configure how much of the file gets verified
    let container = DexFileContainer::new(&file)?
        .verify(true)
        .verify_checksum(true)
        .location(path.to_string());

    let dex = container.open()?;
    println!("{}: {} classes", path, dex.num_class_defs());
    for class_def in dex.get_class_defs() {
        println!("  {}", dex.get_class_desc(class_def)?);
    }
    Ok(())
}

fn parse_in_memory(data: &[u8]) -> anyhow::Result<()> {
    // everything that implements DexContainer can be used
    let dex = DexFile::open(&data, DexLocation::InMemory, VerifyPreset::NoChecksum)?;
    println!("[in-memory]: {} classes", dex.num_class_defs());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    match std::env::args().nth(1) {
        Some(path) => parse_dex_file(&path),
        None => parse_in_memory(include_bytes!("../testdata/minimal.dex")),
    }
}
