//! Worker pools and main-thread dispatch.

mod main_thread;
mod pool;
mod registry;

pub use main_thread::{MainLoop, MainThread, main_thread};
pub(crate) use pool::panic_message;
pub use pool::{PanicPolicy, WorkerPool};
pub use registry::{Executors, PoolKind};
