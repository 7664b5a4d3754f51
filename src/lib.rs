// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod config;
pub mod document;
pub mod indexer;
pub mod tailer;
pub mod transform;
