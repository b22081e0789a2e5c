#![no_main]
use libfuzzer_sys::fuzz_target;
use partstream::{decompress, ChunkConfig, CompressionMethod, MemoryChannel};

// Arbitrary record streams must decode or fail cleanly, never panic
fuzz_target!(|input: &[u8]| {
    if input.is_empty() {
        return;
    }

    let method = match input[0] % 3 {
        0 => CompressionMethod::Deflate,
        1 => CompressionMethod::Lz4,
        _ => CompressionMethod::Zstd,
    };
    let config = ChunkConfig {
        method,
        ..Default::default()
    };

    let mut source = MemoryChannel::from_vec(input[1..].to_vec());
    let mut sink = MemoryChannel::new();
    let _ = decompress(&mut source, &mut sink, &config);
});
