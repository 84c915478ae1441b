//! Allocates executable buffers within branch range of a target entry
//!
//! Allocation strategy after detour-rs: https://github.com/darfink/detour-rs

use std::fmt::{self, Display};
use std::ops::{Deref, DerefMut, Range};
use std::slice;
use std::sync::Mutex;

use lazy_static::lazy_static;
use slice_pool::sync::{SliceBox, SlicePool};

/// The furthest distance between a target and memory reachable from it with a
/// 32-bit displacement (2 GiB)
pub const BRANCH_RANGE: usize = 0x8000_0000;

/// Errors that occur while allocating executable memory
#[derive(Debug)]
pub enum AllocError {
    /// No free mappable region exists within branch range of the target
    OutOfMemory,
    /// Error while querying a memory region
    Region(region::Error),
}

impl Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(
                f,
                "no executable memory available within branch range of the target"
            ),
            Self::Region(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AllocError {}

/// A handle for allocated executable memory.
///
/// The memory is readable, writable and executable; it returns to its pool
/// when the handle is dropped.
pub struct ExecutableMemory {
    /// Slice of the pool backing this allocation
    data: SliceBox<u8>,
}

impl ExecutableMemory {
    /// Address of the allocation
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.deref()
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.deref_mut()
    }
}

/// Pool of executable memory maps, shared process-wide
struct ArenaPool {
    /// Memory pools used for allocations, one per mapped region.
    /// Pools are kept for the lifetime of the process; individual
    /// allocations return to their pool when dropped.
    pools: Vec<SlicePool<u8>>,
}

lazy_static! {
    /// Shared arena for every redirection in the process
    static ref ARENA: Mutex<ArenaPool> = Mutex::new(ArenaPool { pools: Vec::new() });
}

/// Allocates read-, write- and executable memory within [`BRANCH_RANGE`] of
/// `origin`
pub fn allocate_near(origin: usize, size: usize) -> Result<ExecutableMemory, AllocError> {
    let range = origin.saturating_sub(BRANCH_RANGE)..origin.saturating_add(BRANCH_RANGE);
    let mut arena = ARENA.lock().unwrap();

    // Check if an existing in-range pool can satisfy the request
    for pool in &arena.pools {
        let base = pool.as_ptr() as usize;
        if range.contains(&base) && range.contains(&(base + pool.len() - 1)) {
            if let Some(data) = pool.alloc(size) {
                return Ok(ExecutableMemory { data });
            }
        }
    }

    // ... otherwise map a new pool close to the origin. Regions after the
    // origin are tried first; some platforms cannot map below the process
    // image.
    let pool_size = size.max(region::page::size());
    let candidates =
        free_regions(origin, range.clone(), false).chain(free_regions(origin, range, true));
    for candidate in candidates {
        let address = candidate.map_err(AllocError::Region)?;
        if let Some(pool) = map_fixed_pool(address, pool_size) {
            let data = pool.alloc(size).ok_or(AllocError::OutOfMemory)?;
            arena.pools.push(pool);
            return Ok(ExecutableMemory { data });
        }
    }

    Err(AllocError::OutOfMemory)
}

/// Tries to map a read/write/execute pool at the given fixed address
fn map_fixed_pool(address: usize, size: usize) -> Option<SlicePool<u8>> {
    mmap::MemoryMap::new(
        size,
        &[
            mmap::MapOption::MapReadable,
            mmap::MapOption::MapWritable,
            mmap::MapOption::MapExecutable,
            mmap::MapOption::MapAddr(address as *const _),
        ],
    )
    .ok()
    .map(|map| SlicePool::new(MappedRegion(map)))
}

/// Walks unmapped page-aligned addresses starting at `origin`
fn free_regions(
    origin: usize,
    range: Range<usize>,
    backward: bool,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    let page_size = region::page::size();
    let mut current = origin & !(page_size - 1);

    std::iter::from_fn(move || {
        while current > 0 && range.contains(&current) {
            match region::query(current as *const ()) {
                // Mapped; skip past the whole region
                Ok(reg) => {
                    current = if backward {
                        reg.as_range().start.saturating_sub(page_size)
                    } else {
                        reg.as_range().end
                    };
                }
                Err(region::Error::UnmappedRegion) => {
                    let found = current;
                    current = if backward {
                        current.saturating_sub(page_size)
                    } else {
                        current + page_size
                    };
                    return Some(Ok(found));
                }
                Err(error) => return Some(Err(error)),
            }
        }
        None
    })
}

/// Adapts a memory map to the slice interface `SlicePool` expects
struct MappedRegion(mmap::MemoryMap);

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for MappedRegion {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

#[cfg(test)]
mod tests {
    use super::{allocate_near, BRANCH_RANGE};

    #[test]
    /// Allocations land within branch range and are writable
    fn test_allocate_in_range() {
        let origin = test_allocate_in_range as usize;
        let mut memory = allocate_near(origin, 64).unwrap();

        let distance = (memory.as_ptr() as usize).abs_diff(origin);
        assert!(distance < BRANCH_RANGE);

        memory[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&memory[..4], &[1, 2, 3, 4]);
    }

    #[test]
    /// Separate allocations do not alias
    fn test_allocations_disjoint() {
        let origin = test_allocations_disjoint as usize;
        let mut a = allocate_near(origin, 32).unwrap();
        let mut b = allocate_near(origin, 32).unwrap();

        a[0] = 0xaa;
        b[0] = 0xbb;
        assert_eq!(a[0], 0xaa);
        assert_eq!(b[0], 0xbb);
    }
}
