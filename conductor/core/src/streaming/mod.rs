//! Streaming Reconciliation
//!
//! Turns the snapshots of a server-maintained, append-only stream buffer into
//! transcript updates, and decides when a streamed answer is finished.
//!
//! # Architecture
//!
//! ```text
//!  stream subscription ──► StreamWatcher ──► MessageStore::upsert_streaming
//!        (snapshots)            │
//!                               ├──► ScrollScheduler ──► ScrollCallback (UI)
//!                               │
//!                               └──► CompletionTimer ──► MessageStore::finalize
//!                                     (quiet window)
//! ```
//!
//! The backend never says "done". A stream is considered finished once no
//! snapshot has arrived for the quiet window; any later snapshot restarts the
//! window.

mod scroll;
mod timer;
mod watcher;

pub use scroll::{ScrollCallback, ScrollScheduler};
pub use timer::{CompletionTimer, TimerToken};
pub use watcher::{extract_text, SnapshotOutcome, StreamWatcher};
