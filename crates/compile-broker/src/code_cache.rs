//! Segmented code cache
//!
//! Tracks generated-code space per blob kind. Back-ends allocate through
//! the compile environment; decompiled code gives its space back with
//! `release`. The broker only reads capacity and reacts to "full".

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Code cache segment
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeBlobKind {
    /// Stubs, adapters and other non-method code
    NonMethod,
    /// Code with profiling instrumentation
    Profiled,
    /// Fully optimized code
    NonProfiled,
}

impl CodeBlobKind {
    const ALL: [CodeBlobKind; 3] = [
        CodeBlobKind::NonMethod,
        CodeBlobKind::Profiled,
        CodeBlobKind::NonProfiled,
    ];

    fn index(self) -> usize {
        match self {
            CodeBlobKind::NonMethod => 0,
            CodeBlobKind::Profiled => 1,
            CodeBlobKind::NonProfiled => 2,
        }
    }
}

/// Allocation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Code cache segment {kind:?} is full ({requested} bytes requested, {available} available)")]
pub struct CodeCacheFull {
    /// Segment that ran out of space
    pub kind: CodeBlobKind,
    /// Requested size
    pub requested: usize,
    /// Space left at the time of the request
    pub available: usize,
}

/// A block of allocated code space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRegion {
    id: u64,
    kind: CodeBlobKind,
    size: usize,
}

impl CodeRegion {
    /// Region identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Segment the region lives in
    pub fn kind(&self) -> CodeBlobKind {
        self.kind
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

struct Segment {
    capacity: usize,
    used: AtomicUsize,
}

/// Thread-safe segmented code cache
pub struct CodeCache {
    segments: [Segment; 3],
    /// Region ID → size of live allocations
    regions: RwLock<FxHashMap<u64, (CodeBlobKind, usize)>>,
    next_region: AtomicU64,
    full_count: AtomicU64,
}

impl CodeCache {
    /// Create a cache with `capacity` bytes in each segment
    pub fn new(capacity: usize) -> Self {
        Self::with_segments(capacity, capacity, capacity)
    }

    /// Create a cache with explicit segment sizes
    pub fn with_segments(non_method: usize, profiled: usize, non_profiled: usize) -> Self {
        let seg = |capacity| Segment {
            capacity,
            used: AtomicUsize::new(0),
        };
        CodeCache {
            segments: [seg(non_method), seg(profiled), seg(non_profiled)],
            regions: RwLock::new(FxHashMap::default()),
            next_region: AtomicU64::new(1),
            full_count: AtomicU64::new(0),
        }
    }

    /// Allocate `size` bytes in the `kind` segment
    pub fn allocate(&self, kind: CodeBlobKind, size: usize) -> Result<CodeRegion, CodeCacheFull> {
        let segment = &self.segments[kind.index()];
        let mut current = segment.used.load(Ordering::Relaxed);
        loop {
            let wanted = current.checked_add(size).filter(|&end| end <= segment.capacity);
            let Some(end) = wanted else {
                self.full_count.fetch_add(1, Ordering::Relaxed);
                return Err(CodeCacheFull {
                    kind,
                    requested: size,
                    available: segment.capacity - current,
                });
            };
            match segment.used.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let id = self.next_region.fetch_add(1, Ordering::Relaxed);
        self.regions.write().insert(id, (kind, size));
        Ok(CodeRegion { id, kind, size })
    }

    /// Return a region's space to its segment. Releasing twice is a no-op.
    pub fn release(&self, region: &CodeRegion) -> bool {
        let removed = self.regions.write().remove(&region.id);
        match removed {
            Some((kind, size)) => {
                self.segments[kind.index()].used.fetch_sub(size, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Free space in the `kind` segment
    pub fn unallocated_capacity(&self, kind: CodeBlobKind) -> usize {
        let segment = &self.segments[kind.index()];
        segment.capacity - segment.used.load(Ordering::Acquire).min(segment.capacity)
    }

    /// Capacity of the `kind` segment
    pub fn capacity(&self, kind: CodeBlobKind) -> usize {
        self.segments[kind.index()].capacity
    }

    /// Bytes in use across all segments
    pub fn total_used(&self) -> usize {
        CodeBlobKind::ALL
            .iter()
            .map(|k| self.segments[k.index()].used.load(Ordering::Relaxed))
            .sum()
    }

    /// Number of live regions
    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    /// Number of failed allocations so far
    pub fn full_count(&self) -> u64 {
        self.full_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let cache = CodeCache::new(1024);
        let region = cache.allocate(CodeBlobKind::Profiled, 100).unwrap();
        assert_eq!(cache.unallocated_capacity(CodeBlobKind::Profiled), 924);
        assert_eq!(cache.unallocated_capacity(CodeBlobKind::NonProfiled), 1024);
        assert_eq!(cache.region_count(), 1);

        assert!(cache.release(&region));
        assert!(!cache.release(&region));
        assert_eq!(cache.unallocated_capacity(CodeBlobKind::Profiled), 1024);
        assert_eq!(cache.total_used(), 0);
    }

    #[test]
    fn test_segment_full() {
        let cache = CodeCache::with_segments(64, 200, 200);
        assert!(cache.allocate(CodeBlobKind::NonProfiled, 100).is_ok());
        assert!(cache.allocate(CodeBlobKind::NonProfiled, 100).is_ok());

        let err = cache.allocate(CodeBlobKind::NonProfiled, 1).unwrap_err();
        assert_eq!(err.kind, CodeBlobKind::NonProfiled);
        assert_eq!(err.available, 0);
        assert_eq!(cache.full_count(), 1);

        // Other segments are unaffected
        assert!(cache.allocate(CodeBlobKind::Profiled, 100).is_ok());
    }

    #[test]
    fn test_oversized_request_is_full() {
        let cache = CodeCache::with_segments(64, 200, 200);
        cache.allocate(CodeBlobKind::Profiled, 50).unwrap();

        let err = cache.allocate(CodeBlobKind::Profiled, usize::MAX).unwrap_err();
        assert_eq!(err.requested, usize::MAX);
        assert_eq!(err.available, 150);
        assert_eq!(cache.full_count(), 1);
        assert_eq!(cache.unallocated_capacity(CodeBlobKind::Profiled), 150);
    }
}
