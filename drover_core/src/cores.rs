use std::fmt;
use std::num::NonZeroUsize;
use std::thread;

use thiserror::Error;

/// Defines errors that can arise when reserving CPU cores for a process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The request does not fit into the cores that are still free.
    #[error("requested {requested} cores but only {remaining} of {total} remain free")]
    ResourceExhausted {
        requested: usize,
        remaining: usize,
        total: usize,
    },

    /// A process asked for zero cores.
    #[error("number of cores must be more than zero")]
    InvalidRequest,
}

/// An exclusive range of CPU core indices, formatted the way the fuzzer's
/// `-c` flag expects it: a bare index for one core, `first-last` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRange {
    Single(usize),
    Span { first: usize, last: usize },
}

impl CoreRange {
    pub fn first(&self) -> usize {
        match self {
            CoreRange::Single(id) => *id,
            CoreRange::Span { first, .. } => *first,
        }
    }

    pub fn last(&self) -> usize {
        match self {
            CoreRange::Single(id) => *id,
            CoreRange::Span { last, .. } => *last,
        }
    }
}

impl fmt::Display for CoreRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreRange::Single(id) => write!(f, "{id}"),
            CoreRange::Span { first, last } => write!(f, "{first}-{last}"),
        }
    }
}

/// Hands out exclusive core ranges for the lifetime of one campaign.
///
/// The cursor only ever moves forward; there is no release operation because
/// a campaign's core pinning is static. Reusing a core would require tearing
/// the whole session down and building a new one.
#[derive(Debug)]
pub struct CoreAllocator {
    start: usize,
    next: usize,
    total: usize,
}

impl CoreAllocator {
    /// Creates an allocator over the host's detected core count, starting at
    /// `start_core`.
    pub fn new(start_core: usize) -> Self {
        Self::with_total(start_core, detected_cores())
    }

    /// Creates an allocator with an explicit core count instead of probing
    /// the host.
    pub fn with_total(start_core: usize, total: usize) -> Self {
        Self {
            start: start_core,
            next: start_core,
            total,
        }
    }

    /// Reserves `count` cores and advances the cursor past them.
    pub fn allocate(&mut self, count: usize) -> Result<CoreRange, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidRequest);
        }
        if self.next + count > self.total {
            return Err(AllocError::ResourceExhausted {
                requested: count,
                remaining: self.total.saturating_sub(self.next),
                total: self.total,
            });
        }

        let range = if count == 1 {
            CoreRange::Single(self.next)
        } else {
            CoreRange::Span {
                first: self.next,
                last: self.next + count - 1,
            }
        };
        self.next += count;
        Ok(range)
    }

    /// The number of cores handed out so far.
    pub fn allocated(&self) -> usize {
        self.next - self.start
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

fn detected_cores() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
