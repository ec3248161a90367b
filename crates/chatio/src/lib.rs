//! `chatio`: tiny IO helpers for line-oriented chat traffic.
//!
//! This crate intentionally avoids tokio-util's codecs and implements just what
//! the chat relay needs: CRLF/LF line framing without copying
//! (`BytesMut::split_to(..).freeze()`) and a writer that terminates every
//! message with `\n` so receivers never see two messages coalesced into one
//! read or one message split across two.

pub mod line;

pub use line::{write_line, write_line_parts, LineReader};
