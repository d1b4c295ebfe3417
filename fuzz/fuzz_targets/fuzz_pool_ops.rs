#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

use poolkit_alloc::Allocator;
use poolkit_core::{Allocation, Pool};

fuzz_target!(|data: &[u8]| {
    let allocator = Arc::new(Allocator::default());
    let Ok(root) = Pool::with_allocator(Arc::clone(&allocator)) else {
        return;
    };
    let mut pools = vec![root.clone()];
    let mut live: Vec<(Pool, Allocation, u8)> = Vec::new();

    // Each op is two bytes: an opcode and an argument.
    for op in data.chunks_exact(2) {
        let arg = op[1];
        let pool = pools[usize::from(arg) % pools.len()].clone();
        match op[0] % 6 {
            0 | 1 => {
                let scale = if op[0] & 0x80 != 0 { 1024 } else { 3 };
                let size = usize::from(arg) * scale + 1;
                if let Ok(alloc) = pool.palloc(size) {
                    let _ = pool.bytes_mut(&alloc).map(|mut b| b.fill(arg));
                    live.push((pool, alloc, arg));
                }
            }
            2 => {
                if let Some((owner, alloc, _)) = live.pop() {
                    let _ = owner.free(&alloc, alloc.len());
                }
            }
            3 => {
                if let Ok(child) = pool.create_child() {
                    pools.push(child);
                }
            }
            4 => {
                let _ = pool.clear();
            }
            _ => {
                if pool != root {
                    let _ = pool.destroy();
                }
            }
        }
        pools.retain(Pool::is_alive);
        // Surviving allocations still hold the byte they were filled with.
        live.retain(|(owner, alloc, fill)| match owner.bytes(alloc) {
            Ok(bytes) => {
                assert!(bytes.iter().all(|b| b == fill));
                true
            }
            Err(_) => false,
        });
    }

    root.destroy().expect("root destroy");
    assert_eq!(allocator.allocated_bytes(), 0);
});
