use std::io;

use thiserror::Error;

/// Errors raised by the protocol core. The variant determines how far the
///  damage reaches: an error on one connection closes that connection only,
///  while the shared sockets stay open (see the per-operation documentation).
#[derive(Debug, Error)]
pub enum NetError {
    /// A socket operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The byte stream is not a valid sequence of frames: malformed length
    ///  prefix, or a frame larger than the object buffer.
    #[error("framing error: {0}")]
    Framing(String),

    /// The serialization collaborator rejected an object or a payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A serialized object does not fit into the free write-buffer space. The
    ///  sender has lost synchronization with the wire, so the connection must
    ///  be closed.
    #[error("write buffer overflow: {needed} bytes needed, {available} free")]
    BufferOverflow { needed: usize, available: usize },

    /// An operation that is invalid as configured, e.g. binding with a
    ///  zero-sized buffer. State errors on a live connection (a UDP send on a
    ///  connection that never registered UDP, say) are reported through the
    ///  zero-length send return instead, not as a typed error.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The underlying socket was taken away while an operation was in flight,
    ///  typically by a concurrent close.
    #[error("selection key cancelled")]
    Cancelled,
}

impl NetError {
    pub fn framing(msg: impl Into<String>) -> NetError {
        NetError::Framing(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> NetError {
        NetError::Serialization(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> NetError {
        NetError::IllegalState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::framing(NetError::framing("prefix too long"), "framing error: prefix too long")]
    #[case::serialization(NetError::serialization("bad tag"), "serialization error: bad tag")]
    #[case::overflow(NetError::BufferOverflow { needed: 130, available: 64 }, "write buffer overflow: 130 bytes needed, 64 free")]
    #[case::illegal_state(NetError::illegal_state("zero-sized buffer"), "illegal state: zero-sized buffer")]
    #[case::cancelled(NetError::Cancelled, "selection key cancelled")]
    fn test_display(#[case] error: NetError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }
}
