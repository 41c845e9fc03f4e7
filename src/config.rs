use crate::error::{NetError, Result};

pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 16384;
pub const DEFAULT_OBJECT_BUFFER_SIZE: usize = 2048;

/// Buffer sizing for a [Server](crate::Server). Bind addresses are passed to
///  `bind` directly; there is no environment or on-disk configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// One buffer of this size is allocated per connected client. Objects are
    ///  serialized to the write buffer, where the bytes are queued until they
    ///  can be written to the TCP socket. Normally the socket is writable and
    ///  the bytes are written immediately; if it is not and enough serialized
    ///  objects queue up to overflow the buffer, the connection is closed.
    ///
    /// Size this at least as large as the largest object that will be sent,
    ///  plus head room for queued objects while the socket is temporarily not
    ///  writable.
    pub write_buffer_size: usize,

    /// One (TCP only) or three (TCP and UDP) buffers of this size are
    ///  allocated. They hold the bytes of a single object graph until it can
    ///  be sent or deserialized, so this bounds the size of any one object in
    ///  either direction.
    pub object_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            object_buffer_size: DEFAULT_OBJECT_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn new(write_buffer_size: usize, object_buffer_size: usize) -> ServerConfig {
        ServerConfig {
            write_buffer_size,
            object_buffer_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 {
            return Err(NetError::illegal_state("write buffer size must be positive"));
        }
        if self.object_buffer_size == 0 {
            return Err(NetError::illegal_state("object buffer size must be positive"));
        }
        // the length prefix covers 0..2^31-1
        if self.object_buffer_size > i32::MAX as usize {
            return Err(NetError::illegal_state("object buffer size exceeds the frame length range"));
        }
        Ok(())
    }
}
