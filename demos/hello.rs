//! A minimal tour: allocate, write, inspect, resize, free, report.

use fitalloc::{Allocator, FitPolicy, FixedRegion};

fn main() {
    env_logger::init();

    let mut heap = Allocator::with_policy(FixedRegion::default(), FitPolicy::BestFit);

    let ptr = heap.allocate(64).expect("allocation failed");
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 64) };
    println!("allocated 64 bytes at {:p}", ptr);

    if let Some(check) = heap.check_block(ptr) {
        println!("{}", check);
    }

    let grown = heap
        .resize(Some(ptr), 200)
        .expect("resize failed")
        .expect("resize returned a block");
    println!("resized to 200 bytes at {:p}", grown);

    heap.free(grown);

    println!("{}", heap.stats());
    println!("--- journal (newest first) ---");
    println!("{}", heap.journal());
}
