//! Signals the agent emits in its output stream.
//!
//! The only signal acted on is the block marker: a line starting with the
//! configured marker (default `BLOCKED:`) means the agent cannot continue.
//! The rest of the line is the reason.

mod scanner;

pub use scanner::{BlockSignalScanner, BlockerSignal};

pub const DEFAULT_BLOCK_MARKER: &str = "BLOCKED:";
