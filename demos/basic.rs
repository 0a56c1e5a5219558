use hugealloc::{Config, HugeAllocator, acquire, enable_huge_pages, release};

fn main() {
    env_logger::init();

    if let Err(e) = enable_huge_pages() {
        println!("Huge pages not ready ({e}), falling back to the heap");
    }

    let config = Config::from_env();

    unsafe {
        let addr = acquire(4096);
        println!("Requested 4096 bytes of memory");
        println!("Received this address: {addr:?}");

        if !addr.is_null() {
            addr.write(42);
        }
        release(addr);
    }

    let mut allocator = HugeAllocator::new(config);
    match allocator.acquire(8 * 1024 * 1024) {
        Ok(handle) => {
            let bytes = allocator.as_mut_slice(handle).unwrap();
            bytes.fill(7);
            println!("{handle:?}: {} bytes ({:?})", bytes.len(), allocator.backing(handle).unwrap());

            allocator.release(handle).unwrap();
        }
        Err(e) => println!("Acquire failed: {e}"),
    }
}
