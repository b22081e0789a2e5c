#![no_main]
use libfuzzer_sys::fuzz_target;
use partstream::VersionRecord;

// Decoded records must re-encode to the bytes they came from
fuzz_target!(|input: &[u8]| {
    if let Ok(record) = VersionRecord::from_bytes(input) {
        let encoded = record.to_bytes();
        assert_eq!(encoded.len(), record.encoded_len());
        assert_eq!(VersionRecord::from_bytes(&encoded).unwrap(), record);
    }
});
