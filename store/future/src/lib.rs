//! cairn-future: awaitable single-assignment result.
//!
//! This crate provides the coordination primitive used to stitch asynchronous
//! update pipelines together:
//!
//! - [`FutureAdapter`] - single-assignment result with parked waiters and
//!   listener callbacks, completed at most once
//! - [`FutureError`] - terminal and wait errors (`Cancelled`, `Timeout`,
//!   `Interrupted`, `Failed`)
//! - [`Interrupt`] - cooperative interrupt handle for blocked waiters
//! - [`Executor`] - minimal task executor used by [`FutureAdapter::chain_with`]
//!
//! # Design
//!
//! The adapter keeps its waiters in a lock-free Treiber stack hanging off a
//! single atomic slot. Completion seals the stack exactly once and walks it
//! in LIFO order, unparking threads and running listener callbacks. Waiters
//! that give up (timeout, interrupt) tombstone their node instead of
//! unlinking it; a racing completion skips tombstoned nodes, which is
//! harmless.
//!
//! ```
//! use cairn_future::FutureAdapter;
//! use std::sync::Arc;
//!
//! let fut: Arc<FutureAdapter<String>> = Arc::new(FutureAdapter::new());
//! let chained = fut.chain(|res| res.map(|s| format!("{s}!")));
//!
//! assert!(fut.on_done("ok".to_string()));
//! assert_eq!(chained.get().unwrap(), "ok!");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod adapter;
mod interrupt;

pub use adapter::{Executor, FutureAdapter, FutureError};
pub use interrupt::Interrupt;
