//! Command-submission core for compute GPUs.
//!
//! The work lives in two crates: `neo-cmd` (command records, the append-only arena and the
//! stream decoder) and `neo-core` (command lists, queues, the command stream receiver and the
//! device). This package re-exports both and carries the end-to-end tests.

pub use neo_cmd as cmd;
pub use neo_core::*;
