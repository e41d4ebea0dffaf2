//! File watchers (§4.6): incremental readers the observation server polls to turn
//! append-only files into event deltas.

pub mod log_watcher;
pub mod sdk_watcher;

pub use log_watcher::LogWatcher;
pub use sdk_watcher::SdkOutputWatcher;
