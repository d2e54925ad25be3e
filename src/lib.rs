// SPDX-License-Identifier: Apache-2.0

//! skiff: a log shipping agent.
//!
//! The crate discovers log files matching glob patterns, tails them with
//! durable byte offsets, and forwards their lines to a downstream sink.

pub mod bounded_channel;
pub mod positions;
pub mod sink;
pub mod targets;
