pub mod config;
pub mod error;
pub mod log;
pub mod util;

// Progress estimation and distributed work loops
pub mod process;
pub mod progress;
pub mod sim;

pub use error::{Error, Result};
pub use process::{Deployment, NodeId, Process, ProcessManager, SessionId};
pub use progress::{ProgressNode, TickScheduler};
