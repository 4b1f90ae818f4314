use std::hint::black_box;
use std::mem::MaybeUninit;

use tracing::debug;

/// Granularity at which fresh regions are touched to force physical backing.
pub const PAGE_SIZE: usize = 4096;

/// A committed, page-touched block of process memory.
pub struct MemoryRegion {
    buf: Vec<MaybeUninit<u8>>,
    requested: usize,
}

impl MemoryRegion {
    /// Commits `size` bytes and touches every page. Returns `None` if the allocator
    /// declines the request.
    pub fn commit(size: usize) -> Option<Self> {
        let mut buf = Vec::new();
        if let Err(error) = buf.try_reserve_exact(size) {
            debug!(size, %error, "memory commit declined");
            return None;
        }
        buf.resize_with(size, MaybeUninit::uninit);

        let mut region = Self {
            buf,
            requested: size,
        };
        region.touch();
        Some(region)
    }

    fn touch(&mut self) {
        for offset in (0..self.buf.len()).step_by(PAGE_SIZE) {
            self.buf[offset].write((offset % 256) as u8);
        }
        black_box(&mut self.buf);
    }

    pub fn requested_size(&self) -> usize {
        self.requested
    }

    /// Size of the block as reported by the allocator, which may exceed the
    /// requested size.
    pub fn committed_size(&self) -> usize {
        if self.buf.capacity() == 0 {
            return 0;
        }
        allocator_usable_size(&self.buf)
    }
}

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
fn allocator_usable_size(buf: &Vec<MaybeUninit<u8>>) -> usize {
    // SAFETY: `buf` owns a live, non-empty allocation made by the global allocator,
    // which is jemalloc for every build that compiles this function.
    unsafe { jemallocator::usable_size(buf.as_ptr()) }
}

#[cfg(not(all(feature = "jemalloc", not(target_env = "msvc"))))]
fn allocator_usable_size(buf: &Vec<MaybeUninit<u8>>) -> usize {
    buf.capacity()
}

/// Ordered collection of regions. Grows at the tail and shrinks from the tail.
#[derive(Default)]
pub struct RegionArena {
    regions: Vec<MemoryRegion>,
}

impl RegionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits regions of at most `chunk_size` bytes until the committed total reaches
    /// `target`, `keep_going` turns false, or a commit fails. Returns bytes committed.
    pub fn grow_to(&mut self, target: u64, chunk_size: u64, keep_going: impl Fn() -> bool) -> u64 {
        let mut current = self.committed_size();
        let start = current;

        while current < target && keep_going() {
            let size = (target - current).min(chunk_size.max(1));
            let Ok(size) = usize::try_from(size) else {
                break;
            };
            match MemoryRegion::commit(size) {
                Some(region) => {
                    current += region.committed_size() as u64;
                    self.regions.push(region);
                }
                None => break,
            }
        }

        current - start
    }

    /// Releases tail regions while the remaining total stays at or above `target`.
    /// Returns bytes released.
    pub fn shrink_to(&mut self, target: u64) -> u64 {
        let mut current = self.committed_size();
        let start = current;

        while let Some(tail) = self.regions.last() {
            let size = tail.committed_size() as u64;
            if current - size < target {
                break;
            }
            self.regions.pop();
            current -= size;
        }

        start - current
    }

    /// Sum of the allocator-reported sizes of every live region.
    pub fn committed_size(&self) -> u64 {
        self.regions
            .iter()
            .map(|r| r.committed_size() as u64)
            .sum()
    }

    pub fn release_all(&mut self) -> u64 {
        let released = self.committed_size();
        self.regions.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_committed_size_covers_request() {
        let region = MemoryRegion::commit(3 * PAGE_SIZE + 17).unwrap();
        assert_eq!(region.requested_size(), 3 * PAGE_SIZE + 17);
        assert!(region.committed_size() >= region.requested_size());
    }

    #[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
    #[test]
    fn test_committed_size_is_allocator_size_class() {
        let region = MemoryRegion::commit(3 * PAGE_SIZE + 17).unwrap();
        assert!(region.committed_size() >= region.buf.capacity());
    }

    #[cfg(not(all(feature = "jemalloc", not(target_env = "msvc"))))]
    #[test]
    fn test_committed_size_falls_back_to_capacity() {
        let region = MemoryRegion::commit(3 * PAGE_SIZE + 17).unwrap();
        assert_eq!(region.committed_size(), region.buf.capacity());
    }

    #[test]
    fn test_zero_sized_region() {
        let region = MemoryRegion::commit(0).unwrap();
        assert_eq!(region.committed_size(), 0);
    }

    #[test]
    fn test_impossible_commit_is_declined() {
        assert!(MemoryRegion::commit(usize::MAX).is_none());
    }

    #[test]
    fn test_grow_reaches_target_within_one_chunk() {
        let mut arena = RegionArena::new();
        let target = 5 * MIB + 123_456;
        let committed = arena.grow_to(target, 2 * MIB, || true);

        assert_eq!(arena.len(), 3);
        assert_eq!(committed, arena.committed_size());
        assert!(arena.committed_size() >= target);
        assert!(arena.committed_size() < target + 2 * MIB);
    }

    #[test]
    fn test_grow_stops_when_asked() {
        let mut arena = RegionArena::new();
        assert_eq!(arena.grow_to(8 * MIB, MIB, || false), 0);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_shrink_releases_tail_without_undershooting() {
        let mut arena = RegionArena::new();
        arena.grow_to(8 * MIB, MIB, || true);
        assert_eq!(arena.len(), 8);

        let released = arena.shrink_to(5 * MIB + 1);
        assert_eq!(arena.len(), 6);
        assert_eq!(released, 2 * MIB);
        assert!(arena.committed_size() >= 5 * MIB + 1);

        arena.shrink_to(0);
        assert!(arena.is_empty());
        assert_eq!(arena.committed_size(), 0);
    }

    #[test]
    fn test_release_all() {
        let mut arena = RegionArena::new();
        arena.grow_to(3 * MIB, MIB, || true);
        assert_eq!(arena.release_all(), 3 * MIB);
        assert!(arena.is_empty());
    }
}
