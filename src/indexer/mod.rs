// SPDX-License-Identifier: Apache-2.0

pub mod backlog;
pub mod bulk;
pub mod dispatch;
pub mod flock;
pub mod session;
pub mod stats;

pub use session::{Indexer, IndexerConfig, Message};
