//! Suspendable Computations
//!
//! Async handles, manually triggered tasks and relays. All three share the
//! same handle type, so consumers can await or inspect them uniformly.

mod handle;
mod relay;
mod task;

pub(crate) use handle::Frame;
pub use handle::{AsyncHandle, Status};
pub use relay::{relay, relay_with, RelayHooks, StateHandle};
pub use task::{task, task_with, Task};
