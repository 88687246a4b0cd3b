//! Wire format of the upstream channel.
//!
//! # Architecture
//!
//! - **protocol**: Event and Command types, field encoding and first-delimiter splitting
//! - **codec**: newline framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
