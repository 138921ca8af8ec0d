//! Wire layer for master/subordinate remote calls.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Invocation/Reply envelopes, per-interface calls)
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
