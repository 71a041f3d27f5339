//! Protocol implementations.

pub mod crc;
pub mod xmodem;

// Re-export common types
pub use xmodem::{BlockSize, XmodemFlags, XmodemSender, XmodemState};

/// Outcome of a successful `tick()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Work remains; call `tick()` again.
    Pending,
    /// Finished successfully.
    Complete,
}

impl Status {
    /// Whether the operation finished.
    pub fn is_complete(self) -> bool {
        self == Self::Complete
    }
}

/// Whether a state handler wants the same tick to carry on into the next
/// state or to return to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Yield,
}
