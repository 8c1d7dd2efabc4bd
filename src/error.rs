//! Recoverable kernel errors.
//!
//! Broken invariants are not errors: they halt the kernel with a panic.

use core::fmt;

/// Failure to create a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The page allocator had no block left for the thread.
    OutOfMemory,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::OutOfMemory => f.write_str("out of memory for thread block"),
        }
    }
}
