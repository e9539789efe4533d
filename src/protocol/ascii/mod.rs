//! Line-based ASCII harness protocol.
//!
//! Requests are single `\n`-terminated lines (`PING`, `INFO`,
//! `SET <FIELD> <UNIT> <VALUE>`, `READ <FIELD> <UNIT>`). Replies are `OK`,
//! `RESP <FIELD> ...` or `ERR <REASON>`.

pub mod client;
pub mod command;
pub mod responder;

pub use client::{AsciiClient, RESPONSE_WINDOW_FACTOR};
pub use command::{format_line, parse_request, sanitize, ErrorReason, Request, Verb};
pub use responder::{AsciiResponder, READY_LINE};
