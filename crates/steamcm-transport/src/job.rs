//! Job identifiers used to correlate requests with their responses.
//!
//! A [`JobId`] packs four fields into 64 bits:
//!
//! | bits   | field                                             |
//! |--------|---------------------------------------------------|
//! | 0..32  | sequential counter                                |
//! | 32..50 | start time, seconds since 2005-01-01 mod 2^18     |
//! | 50..54 | process id                                        |
//! | 54..64 | box id                                            |
//!
//! The all-zero value means "no job".

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix timestamp of 2005-01-01T00:00:00Z, the epoch of the start-time field.
const START_TIME_EPOCH: u64 = 1_104_537_600;

const SEQUENCE_MASK: u64 = 0xFFFF_FFFF;
const START_TIME_SHIFT: u32 = 32;
const START_TIME_MASK: u64 = (1 << 18) - 1;
const PROCESS_SHIFT: u32 = 50;
const PROCESS_MASK: u64 = 0xF;
const BOX_SHIFT: u32 = 54;
const BOX_MASK: u64 = 0x3FF;

/// 64-bit job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct JobId(pub u64);

impl JobId {
    /// "No job": unsolicited messages and requests that expect no reply.
    pub const NONE: JobId = JobId(0);

    /// Packs the four fields into an identifier. Out-of-range fields are masked.
    pub fn compose(sequence: u32, start_time: u32, process_id: u8, box_id: u16) -> JobId {
        JobId(
            (sequence as u64)
                | ((start_time as u64 & START_TIME_MASK) << START_TIME_SHIFT)
                | ((process_id as u64 & PROCESS_MASK) << PROCESS_SHIFT)
                | ((box_id as u64 & BOX_MASK) << BOX_SHIFT),
        )
    }

    /// True for [`JobId::NONE`].
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Sequential counter component.
    pub fn sequence(self) -> u32 {
        (self.0 & SEQUENCE_MASK) as u32
    }

    /// Start-time component.
    pub fn start_time(self) -> u32 {
        ((self.0 >> START_TIME_SHIFT) & START_TIME_MASK) as u32
    }

    /// Process id component.
    pub fn process_id(self) -> u8 {
        ((self.0 >> PROCESS_SHIFT) & PROCESS_MASK) as u8
    }

    /// Box id component.
    pub fn box_id(self) -> u16 {
        ((self.0 >> BOX_SHIFT) & BOX_MASK) as u16
    }
}

impl From<u64> for JobId {
    fn from(raw: u64) -> Self {
        JobId(raw)
    }
}

impl From<JobId> for u64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates job identifiers for one client instance.
///
/// Allocation is a single atomic increment, so concurrent callers never observe the same
/// counter value. The counter starts at 1 and skips 0 when it wraps.
#[derive(Debug)]
pub struct JobIdAllocator {
    counter: AtomicU64,
    start_time: u32,
    process_id: u8,
    box_id: u16,
}

impl JobIdAllocator {
    /// Allocator with process id and box id zero, stamped with the current start time.
    pub fn new() -> Self {
        Self::with_identity(0, 0)
    }

    /// Allocator with an explicit process id and box id.
    pub fn with_identity(process_id: u8, box_id: u16) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(START_TIME_EPOCH);
        let start_time = (now.saturating_sub(START_TIME_EPOCH) & START_TIME_MASK) as u32;
        Self {
            counter: AtomicU64::new(0),
            start_time,
            process_id,
            box_id,
        }
    }

    /// Returns the next identifier.
    pub fn next_job_id(&self) -> JobId {
        loop {
            let raw = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let sequence = (raw & SEQUENCE_MASK) as u32;
            if sequence != 0 {
                return JobId::compose(sequence, self.start_time, self.process_id, self.box_id);
            }
        }
    }

    /// Start-time component stamped on every identifier from this allocator.
    pub fn start_time(&self) -> u32 {
        self.start_time
    }
}

impl Default for JobIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_none_is_zero() {
        assert!(JobId::NONE.is_none());
        assert_eq!(u64::from(JobId::NONE), 0);
        assert!(!JobId(7).is_none());
    }

    #[test]
    fn test_sequential_count() {
        let alloc = JobIdAllocator::new();
        let first = alloc.next_job_id();
        assert_eq!(first.sequence(), 1);
        for _ in 0..1000 {
            alloc.next_job_id();
        }
        assert_eq!(alloc.next_job_id().sequence(), 1002);
    }

    #[test]
    fn test_default_process_and_box() {
        let id = JobIdAllocator::new().next_job_id();
        assert_eq!(id.process_id(), 0);
        assert_eq!(id.box_id(), 0);
    }

    #[test]
    fn test_compose_fields() {
        let id = JobId::compose(42, 0x3_FFFF, 0xF, 0x3FF);
        assert_eq!(id.sequence(), 42);
        assert_eq!(id.start_time(), 0x3_FFFF);
        assert_eq!(id.process_id(), 0xF);
        assert_eq!(id.box_id(), 0x3FF);
    }

    #[test]
    fn test_with_identity() {
        let alloc = JobIdAllocator::with_identity(3, 17);
        let id = alloc.next_job_id();
        assert_eq!(id.process_id(), 3);
        assert_eq!(id.box_id(), 17);
        assert_eq!(id.start_time(), alloc.start_time());
    }

    #[test]
    fn test_counter_skips_zero_on_wrap() {
        let alloc = JobIdAllocator::new();
        alloc.counter.store(u32::MAX as u64 - 1, Ordering::Relaxed);
        assert_eq!(alloc.next_job_id().sequence(), u32::MAX);
        assert_eq!(alloc.next_job_id().sequence(), 1);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let alloc = Arc::new(JobIdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    let ids: Vec<JobId> = (0..1000).map(|_| alloc.next_job_id()).collect();
                    assert!(ids.windows(2).all(|w| w[0].sequence() < w[1].sequence()));
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
