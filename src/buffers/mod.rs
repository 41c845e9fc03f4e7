//! Buffer and container support for the protocol core:
//!
//! * fixed-length, pre-allocated byte buffers for framing and datagram I/O
//! * copy-on-write containers whose readers iterate an immutable snapshot
//!   while writers swap in a fresh copy under a short-lived lock

mod cow;
mod fixed_buffer;

pub use cow::{CowList, CowMap};
pub use fixed_buffer::FixedBuf;
