//! Memory image for the virtual CPU.
//!
//! A flat array of signed words split into three zones:
//!
//! | Zone          | Code base    | Stack top (grows down) |
//! |---------------|--------------|------------------------|
//! | User          | 0            | `BOTTOM_USER`          |
//! | Timer handler | `TOP_TIMER`  | `BOTTOM_SYSTEM`        |
//! | System call   | `TOP_SYSTEM` | `BOTTOM_SYSTEM`        |
//!
//! The timer handler and system-call zones share one privileged stack.

use serde::{Serialize, Deserialize};
use thiserror::Error;

/// A machine word. Arithmetic wraps at the host integer width.
pub type Word = i32;

/// Highest user-zone address; also the top of the user stack.
pub const BOTTOM_USER: Word = 999;

/// First address of the timer handler's code.
pub const TOP_TIMER: Word = 1000;

/// First address of the system-call handler's code.
pub const TOP_SYSTEM: Word = 1500;

/// Top of the privileged stack shared by both handler modes.
pub const BOTTOM_SYSTEM: Word = 1999;

/// Number of cells in a default image.
///
/// Large enough to back every address up to `BOTTOM_SYSTEM`, so pushes onto
/// the privileged stack never fall off the end of the store.
pub const MEMORY_SIZE: usize = BOTTOM_SYSTEM as usize + 1;

/// Flat, integer-addressed memory image.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    cells: Vec<Word>,
}

impl Memory {
    /// Create a zeroed image covering the full address range.
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_SIZE)
    }

    /// Create a zeroed image with an explicit capacity.
    ///
    /// Smaller capacities are allowed; accesses beyond them fail with
    /// [`MemoryError::OutOfBounds`] even when the zone layout permits them.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: vec![0; capacity],
        }
    }

    /// Number of cells in the image.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Read a cell. Fails if `addr` is outside the allocated capacity.
    #[inline]
    pub fn read(&self, addr: Word) -> Result<Word, MemoryError> {
        let index = self.index(addr)?;
        Ok(self.cells[index])
    }

    /// Write a cell.
    ///
    /// Only raw capacity is checked here. Zone permissions are the caller's
    /// responsibility.
    #[inline]
    pub fn write(&mut self, addr: Word, value: Word) -> Result<(), MemoryError> {
        let index = self.index(addr)?;
        self.cells[index] = value;
        Ok(())
    }

    /// Zero every cell.
    pub fn reset(&mut self) {
        self.cells.fill(0);
    }

    /// Copy `words` into memory starting at `start`.
    pub fn load(&mut self, start: Word, words: &[Word]) -> Result<(), MemoryError> {
        let first = self.index(start)?;
        let available = self.cells.len() - first;
        if words.len() > available {
            return Err(MemoryError::ProgramTooLarge {
                size: words.len(),
                available,
            });
        }

        self.cells[first..first + words.len()].copy_from_slice(words);
        Ok(())
    }

    /// Dump memory contents (for debugging).
    pub fn dump(&self, start: usize, count: usize) -> Vec<(usize, Word)> {
        let end = start.saturating_add(count).min(self.cells.len());
        (start.min(end)..end)
            .map(|i| (i, self.cells[i]))
            .collect()
    }

    fn index(&self, addr: Word) -> Result<usize, MemoryError> {
        usize::try_from(addr)
            .ok()
            .filter(|&i| i < self.cells.len())
            .ok_or(MemoryError::OutOfBounds(addr))
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only show non-zero cells
        let non_zero = self.cells.iter().filter(|&&cell| cell != 0).count();

        f.debug_struct("Memory")
            .field("non_zero_cells", &non_zero)
            .field("total_cells", &self.cells.len())
            .finish()
    }
}

/// Errors that can occur during memory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MemoryError {
    /// Address is outside the allocated image.
    #[error("Index out of bound when access memory (address {0})")]
    OutOfBounds(Word),

    /// A block of words does not fit at the requested position.
    #[error("program size {size} exceeds available space {available}")]
    ProgramTooLarge { size: usize, available: usize },
}
