// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Line-delimited JSON-RPC framing over stdio. Pure transport: method
//! semantics (`initialize`/`prompt`/`cancel`/`shutdown`) are supplied by the
//! caller's [`RpcHandler`] implementation.

mod protocol;
mod server;

pub use protocol::{
    err_response, notification_line, ok_response, parse_incoming, request_line, IncomingMessage,
    RpcError,
};
pub use server::{decode_line_lossy, RpcHandler, RpcServer};
