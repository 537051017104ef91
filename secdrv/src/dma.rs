//! DMA-visible memory and the cursor pools carve their tables from.
//!
//! The driver core maps a physically contiguous region (a UIO memory map, a
//! hugepage, or anonymous memory on hosts where the accelerator sits behind
//! an identity-mapped IOMMU) and hands pools a [`DmaCursor`] over it. Pools
//! carve fixed chunks once at init and never give them back; the region
//! itself stays mapped until the last chunk is dropped.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::error::Error;

/// A mapped region of DMA-visible memory.
pub struct DmaRegion {
    ptr: NonNull<u8>,
    len: usize,
    phys_base: u64,
    /// Whether we mmap'd the region ourselves and must unmap it.
    owned: bool,
}

// Safety: the region is plain memory. Chunks carved from it are disjoint and
// each is accessed through its own `&mut DmaChunk`.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Map `len` bytes of zeroed anonymous memory.
    ///
    /// The physical base is taken to be the virtual address, which holds when
    /// the device sees process memory through an identity-mapped IOMMU.
    pub fn anonymous(len: usize) -> Result<Arc<Self>, Error> {
        assert!(len > 0, "DMA region must not be empty");
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let ptr = NonNull::new(addr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))?;
        log::debug!("dma: mapped {len} bytes at {:p}", ptr);
        Ok(Arc::new(DmaRegion {
            ptr,
            len,
            phys_base: ptr.as_ptr() as u64,
            owned: true,
        }))
    }

    /// Wrap memory mapped by someone else (for example a UIO map).
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must be valid for reads and writes for as long as the
    /// returned region or any chunk carved from it is alive, must not be
    /// accessed through other paths meanwhile, and must be physically
    /// contiguous starting at `phys_base`.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, phys_base: u64) -> Arc<Self> {
        Arc::new(DmaRegion {
            ptr,
            len,
            phys_base,
            owned: false,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Translate a virtual address inside the region to its bus address.
    pub fn vtop(&self, addr: *const u8) -> Option<u64> {
        let start = self.ptr.as_ptr() as usize;
        let addr = addr as usize;
        if addr < start || addr >= start + self.len {
            return None;
        }
        Some(self.phys_base + (addr - start) as u64)
    }

    /// A cursor positioned at the start of the region.
    pub fn cursor(self: &Arc<Self>) -> DmaCursor {
        DmaCursor {
            region: Arc::clone(self),
            offset: 0,
        }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut _, self.len);
            }
        }
    }
}

/// Bump allocator over a [`DmaRegion`]. Owned by the caller; pools advance it.
pub struct DmaCursor {
    region: Arc<DmaRegion>,
    offset: usize,
}

impl DmaCursor {
    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.region.len - self.offset
    }

    pub fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    /// Bytes the next carve at `align` would skip.
    pub fn padding(&self, align: usize) -> usize {
        let here = self.region.ptr.as_ptr() as usize + self.offset;
        here.next_multiple_of(align) - here
    }

    /// Carve `size` bytes aligned to `align` and advance past them.
    ///
    /// `align` must be a power of two.
    pub fn carve(&mut self, size: usize, align: usize) -> Result<DmaChunk, Error> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let base = self.region.ptr.as_ptr() as usize;
        let start = (base + self.offset).next_multiple_of(align) - base;
        let end = start.checked_add(size).filter(|&end| end <= self.region.len);
        let Some(end) = end else {
            return Err(Error::DmaExhausted {
                requested: size,
                remaining: self.remaining(),
            });
        };
        self.offset = end;
        Ok(DmaChunk {
            region: Arc::clone(&self.region),
            offset: start,
            len: size,
        })
    }
}

/// An exclusively owned slice of a [`DmaRegion`].
pub struct DmaChunk {
    region: Arc<DmaRegion>,
    offset: usize,
    len: usize,
}

impl DmaChunk {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        unsafe { self.region.ptr.as_ptr().add(self.offset) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        unsafe { self.region.ptr.as_ptr().add(self.offset) }
    }

    /// Bus address of the first byte, as programmed into hardware.
    pub fn phys_addr(&self) -> u64 {
        self.region.phys_base + self.offset as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carve_advances_and_aligns() {
        let region = DmaRegion::anonymous(4096).unwrap();
        let mut cursor = region.cursor();

        let a = cursor.carve(10, 1).unwrap();
        assert_eq!(cursor.offset(), 10);
        let b = cursor.carve(32, 16).unwrap();
        assert_eq!(b.as_ptr() as usize % 16, 0);
        assert_eq!(cursor.offset(), 48);
        assert_eq!(a.phys_addr(), region.phys_base());
        assert_eq!(b.phys_addr(), region.phys_base() + 16);
        assert_eq!(cursor.remaining(), 4096 - 48);
    }

    #[test]
    fn carve_past_end_fails_without_advancing() {
        let region = DmaRegion::anonymous(64).unwrap();
        let mut cursor = region.cursor();
        let _a = cursor.carve(48, 16).unwrap();
        let err = cursor.carve(32, 16).err().unwrap();
        assert!(matches!(
            err,
            Error::DmaExhausted {
                requested: 32,
                remaining: 16
            }
        ));
        assert_eq!(cursor.offset(), 48);
        assert!(cursor.carve(16, 16).is_ok());
    }

    #[test]
    fn chunk_outlives_cursor_and_region_handle() {
        let region = DmaRegion::anonymous(4096).unwrap();
        let mut chunk = region.cursor().carve(256, 16).unwrap();
        drop(region);
        chunk.as_mut_slice().fill(0xA5);
        assert!(chunk.as_slice().iter().all(|&b| b == 0xA5));
        chunk.zero();
        assert!(chunk.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn vtop_translates_inside_region_only() {
        let mut backing = vec![0u8; 512];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let region = unsafe { DmaRegion::from_raw(ptr, 512, 0x8000_0000) };
        let inside = unsafe { region.as_ptr().add(100) };
        assert_eq!(region.vtop(inside), Some(0x8000_0064));
        let outside = unsafe { region.as_ptr().add(512) };
        assert_eq!(region.vtop(outside), None);
        drop(region);
        drop(backing);
    }
}
