//! Hierarchical progress tracking with time-based estimation.
//!
//! Progress trees aggregate `(total, count)` pairs from their tasks; auto
//! tasks synthesise a steadily advancing count for backends that only
//! report completion, driven by a shared [`TickScheduler`].

mod auto;
mod clock;
mod node;
mod snapshot;
mod timer;

pub use auto::{AutoDrive, Barrier, Target, DEADLINE_GRACE_MS, OVERRUN_INFLATION};
pub use clock::{Clock, ManualClock, SystemClock};
pub use node::{ProgressNode, COMPLETION_TOLERANCE};
pub use snapshot::TaskSnapshot;
pub use timer::{TickScheduler, DEFAULT_TICK_INTERVAL};

/// A fresh root domain on the process-wide scheduler.
pub fn progress_domain() -> ProgressNode {
    ProgressNode::root()
}
