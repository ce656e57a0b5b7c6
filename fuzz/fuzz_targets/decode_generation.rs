#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = postvec::store::EmbeddingStore::from_bytes(data);
    let _ = postvec::LabelMap::from_json(data);
    let _ = postvec::Manifest::from_json(data);
});
