#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use partstream::{Channel, SparseBlockBuffer};
use std::io::SeekFrom;

#[derive(Debug, Arbitrary)]
enum Op {
    Write { offset: u16, data: Vec<u8> },
    SetLen(u16),
}

// Sparse buffer must always read back like a flat last-writer-wins vector
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let merge_gap: u8 = match u.arbitrary() {
        Ok(g) => g,
        Err(_) => return,
    };
    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let mut buffer = SparseBlockBuffer::with_limits(merge_gap as u64, 4096);
    let mut model: Vec<u8> = Vec::new();

    for op in ops.iter().take(64) {
        match op {
            Op::Write { offset, data } => {
                let start = *offset as usize;
                buffer.seek(SeekFrom::Start(start as u64)).unwrap();
                buffer.write(data).unwrap();
                if !data.is_empty() {
                    let end = start + data.len();
                    if model.len() < end {
                        model.resize(end, 0);
                    }
                    model[start..end].copy_from_slice(data);
                }
            }
            Op::SetLen(len) => {
                buffer.set_len(*len as u64).unwrap();
                model.resize(*len as usize, 0);
            }
        }
    }

    let mut out = vec![0u8; model.len()];
    buffer.seek(SeekFrom::Start(0)).unwrap();
    let n = buffer.read_full(&mut out).unwrap();
    assert_eq!(n, model.len());
    assert_eq!(out, model);
});
