//! Integration tests: SG tables as the hardware reads them.

use std::ptr::NonNull;

use secdrv::{
    ConfigBuilder, Direction, DmaRegion, Error, FragmentDescriptor, MAX_SG_ENTRIES, SgContext,
    SgContextPool, SgEntry,
};

fn packet(buffers: &[(u64, u32, u32)]) -> Vec<FragmentDescriptor> {
    let total: u32 = buffers.iter().map(|&(_, _, len)| len).sum();
    buffers
        .iter()
        .map(|&(address, offset, length)| FragmentDescriptor {
            address,
            offset,
            length,
            total_length: total,
            num_fragments: buffers.len() as u32 - 1,
        })
        .collect()
}

#[test]
fn table_bytes_land_in_dma_memory() {
    // Caller-owned backing memory standing in for a UIO map.
    let mut backing = vec![0u128; SgContext::DMA_BYTES / 16];
    let ptr = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
    let region = unsafe { DmaRegion::from_raw(ptr, SgContext::DMA_BYTES, 0x4000_0000) };

    let mut pool = SgContextPool::new(1, &mut region.cursor()).unwrap();
    let token = pool.get_free_context().unwrap();
    let frags = packet(&[(0xdead_0000, 0x10, 0x40), (0xbeef_0000, 0, 0x20)]);
    pool.build_table(&token, &frags, Direction::Output).unwrap();

    let ctx = pool.context(&token);
    let output = ctx.table(Direction::Output);
    assert_eq!(output.phys_addr(), 0x4000_0000 + (MAX_SG_ENTRIES * 16) as u64);

    let raw = unsafe {
        std::slice::from_raw_parts(region.as_ptr().add(MAX_SG_ENTRIES * 16), 32)
    };
    assert_eq!(&raw[0..8], &0xdead_0000u64.to_be_bytes());
    assert_eq!(&raw[8..12], &0x40u32.to_be_bytes());
    assert_eq!(&raw[12..16], &0x10u32.to_be_bytes());
    assert_eq!(&raw[16..24], &0xbeef_0000u64.to_be_bytes());
    assert_eq!(&raw[24..28], &(SgEntry::FINAL | 0x20).to_be_bytes());
    assert_eq!(&raw[28..32], &0u32.to_be_bytes());

    pool.free_context(token);
    drop(pool);
    drop(region);
    drop(backing);
}

#[test]
fn input_and_output_are_independent() {
    let region = DmaRegion::anonymous(2 * SgContext::DMA_BYTES).unwrap();
    let mut pool = SgContextPool::new(2, &mut region.cursor()).unwrap();
    let token = pool.get_free_context().unwrap();

    pool.build_table(&token, &packet(&[(0x1000, 0, 4), (0x2000, 0, 4)]), Direction::Input)
        .unwrap();
    let bad = packet(&[(0x3000, 0, 4), (0, 0, 4)]);
    assert!(matches!(
        pool.build_table(&token, &bad, Direction::Output),
        Err(Error::InvalidInput(_))
    ));

    let ctx = pool.context(&token);
    assert!(ctx.is_enabled(Direction::Input));
    assert!(!ctx.is_enabled(Direction::Output));
    assert_eq!(ctx.table(Direction::Input).len(), 2);
    assert!(ctx.table(Direction::Output).is_empty());
    assert_ne!(
        ctx.table(Direction::Input).phys_addr(),
        ctx.table(Direction::Output).phys_addr()
    );
}

#[test]
fn pool_from_config_fits_config_dma_bytes() {
    let config = ConfigBuilder::new().sg_contexts(3).build().unwrap();
    let region = DmaRegion::anonymous(config.dma_bytes()).unwrap();
    let mut cursor = region.cursor();
    let mut pool = SgContextPool::from_config(&config, &mut cursor).unwrap();
    assert_eq!(pool.capacity(), 3);
    assert_eq!(cursor.remaining(), 0);

    let tokens: Vec<_> = std::iter::from_fn(|| pool.get_free_context()).collect();
    assert_eq!(tokens.len(), 3);
    assert_eq!(pool.stats().in_use, 3);
    for token in tokens {
        pool.free_context(token);
    }
    assert_eq!(pool.destroy().free, 3);
}

#[test]
fn two_pools_carve_one_region() {
    let region = DmaRegion::anonymous(3 * SgContext::DMA_BYTES).unwrap();
    let mut cursor = region.cursor();
    let a = SgContextPool::new(2, &mut cursor).unwrap();
    assert!(matches!(
        SgContextPool::new(2, &mut cursor),
        Err(Error::DmaExhausted { .. })
    ));
    let b = SgContextPool::new(1, &mut cursor).unwrap();
    assert_eq!(a.capacity() + b.capacity(), 3);
}
