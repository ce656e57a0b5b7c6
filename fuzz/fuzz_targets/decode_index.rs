#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(index) = postvec::HNSW::from_bytes(data) {
        // Anything that decodes must be searchable without panicking
        let query = vec![0.5f32; index.dim()];
        let _ = index.search(&query, 3, 10);
        let _ = index.stats();
    }
});
