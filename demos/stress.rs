//! A synthetic workload over real OS pages: random allocations, partial
//! frees, resizes, and a zeroed array, ending with the usage statistics
//! and the operation journal.

use fitalloc::MmapAllocator;

use rand::distributions::{Distribution, Uniform};
use rand::{RngCore, SeedableRng};

const SLOTS: usize = 50;
const MAX_SIZE: usize = 256;

fn main() {
    env_logger::init();

    let seed = rand::thread_rng().next_u64();
    println!("=== Memory stress demo (seed {}) ===", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let sizes = Uniform::new_inclusive(1usize, MAX_SIZE);

    let mut heap = MmapAllocator::default();
    let mut blocks = Vec::with_capacity(SLOTS);

    // Fill a batch of random blocks, each tagged with its index.
    for i in 0..SLOTS {
        let size = sizes.sample(&mut rng);
        match heap.allocate(size) {
            Ok(ptr) => {
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), i as u8, size) };
                blocks.push(Some((ptr, size)));
            }
            Err(err) => {
                println!("allocation {} failed: {}", i, err);
                blocks.push(None);
            }
        }
    }

    // Free every third block, then grow the survivors.
    for slot in blocks.iter_mut().step_by(3) {
        if let Some((ptr, _)) = slot.take() {
            heap.free(ptr);
        }
    }
    for slot in blocks.iter_mut() {
        if let Some((ptr, size)) = *slot {
            let grown = size + (rng.next_u32() as usize % 64);
            if let Ok(Some(fresh)) = heap.resize(Some(ptr), grown) {
                *slot = Some((fresh, grown));
            }
        }
    }

    let zeroed = heap
        .zero_allocate(20, std::mem::size_of::<u32>())
        .expect("zero-allocate failed");
    println!("zero-allocated 20 u32s at {:p}", zeroed);

    for slot in blocks.iter().step_by(10) {
        if let Some((ptr, _)) = *slot {
            if let Some(check) = heap.check_block(ptr) {
                println!("{}", check);
            }
        }
    }

    for slot in blocks.into_iter().flatten() {
        heap.free(slot.0);
    }
    heap.free(zeroed);

    println!("\n=== Final statistics ===");
    println!("{}", heap.stats());
    println!("directory validity: {:?}", heap.verify());

    println!("\n=== Operation journal ===");
    println!("{}", heap.journal());
}
