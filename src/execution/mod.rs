//! Execution records, their lifecycle, and the per-project lock.
//!
//! ```text
//!   queued ──► running ──► awaiting_quality_gate ──► completed
//!     │          │                   └─────────────► failed
//!     │          ├──► blocked | failed | timed_out | cancelled
//!     └──► failed | cancelled
//! ```

pub mod lock;
mod models;
mod store;

pub use lock::{ProjectLockGuard, ProjectLocks};
pub use models::{
    Execution, ExecutionId, ExecutionKind, ExecutionRequest, ExecutionState, ProgressInfo,
    is_valid_transition,
};
pub use store::{DEFAULT_MAX_RETAINED, ExecutionStore};
