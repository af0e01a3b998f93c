// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod bus;
mod envelope;
mod merge;

pub use bus::WireBus;
pub use envelope::{ApprovalDecision, Envelope, WireEvent};
pub use merge::MergeBuffer;
