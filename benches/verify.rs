use criterion::{criterion_group, criterion_main, Criterion};
use dexlink::file::verifier::VerifyPreset;
use dexlink::file::{DexFile, DexLocation, InMemoryDexContainer, TypeLookupTable};
use dexlink::utf;

fn parse_and_verify_small_file(c: &mut Criterion) {
    let data = include_bytes!("../testdata/minimal.dex");
    c.bench_function("parse_and_verify_small_file", |b| {
        b.iter(|| {
            let container = InMemoryDexContainer::new(data);
            let dex = DexFile::from_raw_parts(&container, DexLocation::InMemory).unwrap();
            DexFile::verify(&dex, VerifyPreset::All).unwrap();
        })
    });
}

fn parse_small_file(c: &mut Criterion) {
    let data = include_bytes!("../testdata/minimal.dex");
    c.bench_function("parse_small_file", |b| {
        b.iter(|| {
            let container = InMemoryDexContainer::new(data);
            let dex = DexFile::from_raw_parts(&container, DexLocation::InMemory).unwrap();
            assert_eq!(dex.num_class_defs(), 3);
        })
    });
}

fn lookup_table_hits(c: &mut Criterion) {
    let data = include_bytes!("../testdata/minimal.dex");
    let container = InMemoryDexContainer::new(data);
    let dex = DexFile::from_raw_parts(&container, DexLocation::InMemory).unwrap();
    let table = TypeLookupTable::create(&dex).unwrap();
    c.bench_function("lookup_table_hits", |b| {
        b.iter(|| {
            for descriptor in ["LAlpha;", "LBeta;", "LMain;", "LMissing;"] {
                let _ = table.lookup(descriptor, utf::str_hash(descriptor));
            }
        })
    });
}

criterion_group!(
    benches,
    parse_and_verify_small_file,
    parse_small_file,
    lookup_table_hits
);
criterion_main!(benches);
