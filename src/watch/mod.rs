pub mod debounce;
pub mod dispatch;
pub mod watcher;

pub use dispatch::{ChangeDispatcher, ChangeSubmitter};
pub use watcher::{DebouncedWatcher, WatchError, WatchOptions};
