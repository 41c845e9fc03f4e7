use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

use crate::buffers::FixedBuf;
use crate::connection::Connection;
use crate::error::{NetError, Result};
use crate::serialization::{ObjectBox, Serialization};

/// One non-blocking datagram socket shared by all sessions. Unlike TCP there
///  is no per-message length prefix: one datagram carries exactly one
///  serialized object, bounded by the object buffer size.
///
/// Reads land in an internal buffer keyed by the sender's address; the event
///  loop maps that address to a registered connection (or treats the datagram
///  as a registration / discovery control message).
pub struct UdpChannel {
    serialization: Arc<dyn Serialization>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    read_buffer: Mutex<FixedBuf>,
    write_buffer: Mutex<FixedBuf>,
}

impl UdpChannel {
    pub fn new(serialization: Arc<dyn Serialization>, object_buffer_size: usize) -> UdpChannel {
        UdpChannel {
            serialization,
            socket: Mutex::new(None),
            read_buffer: Mutex::new(FixedBuf::new(object_buffer_size)),
            write_buffer: Mutex::new(FixedBuf::new(object_buffer_size)),
        }
    }

    pub async fn bind(&self, addr: SocketAddr) -> Result<()> {
        let socket = UdpSocket::bind(addr).await?;
        *self.socket.lock().unwrap() = Some(Arc::new(socket));
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().unwrap().as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn close(&self) {
        let _ = self.socket.lock().unwrap().take();
    }

    /// Receives one datagram into the internal buffer, yielding its source
    ///  address. Pending while no datagram is ready.
    pub(crate) fn poll_recv_from(&self, cx: &mut Context<'_>) -> Poll<io::Result<SocketAddr>> {
        let guard = self.socket.lock().unwrap();
        let Some(socket) = guard.as_ref() else {
            return Poll::Pending;
        };

        let mut buffer = self.read_buffer.lock().unwrap();
        buffer.maximize_len();
        let mut read_buf = ReadBuf::new(buffer.as_mut());
        match socket.poll_recv_from(cx, &mut read_buf) {
            Poll::Ready(Ok(from)) => {
                let received = read_buf.filled().len();
                buffer.truncate(received);
                Poll::Ready(Ok(from))
            }
            Poll::Ready(Err(e)) => {
                buffer.truncate(0);
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                buffer.truncate(0);
                Poll::Pending
            }
        }
    }

    /// Decodes one object from the most recently received datagram. The
    ///  optional connection supplies codec context but does not change the
    ///  wire format. A datagram carries exactly one object, so a decode that
    ///  leaves bytes behind is rejected.
    pub fn read_object(&self, connection: Option<&Connection>) -> Result<ObjectBox> {
        let buffer = self.read_buffer.lock().unwrap();
        let mut source = buffer.as_ref();
        let object = self.serialization.read_object(connection, &mut source)?;
        if !source.is_empty() {
            return Err(NetError::serialization(format!(
                "incorrect number of bytes used to deserialize object: {} of {} left over",
                source.len(),
                buffer.len()
            )));
        }
        Ok(object)
    }

    /// Serializes one object into the outbound buffer and transmits it as a
    ///  single datagram. Returns `None` if the kernel's send buffer was full,
    ///  which is not fatal: the datagram is simply lost, as datagrams are.
    pub fn send(&self, connection: Option<&Connection>, object: &dyn Any, to: SocketAddr) -> Result<Option<usize>> {
        let socket = {
            let guard = self.socket.lock().unwrap();
            match guard.as_ref() {
                Some(socket) => socket.clone(),
                None => return Err(NetError::Cancelled),
            }
        };

        let mut buffer = self.write_buffer.lock().unwrap();
        buffer.clear();
        self.serialization.write_object(connection, &mut buffer, object)?;

        match socket.try_send_to(buffer.as_ref(), to) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NetError::Io(e)),
        }
    }

    /// Raw datagram transmit for collaborators that define their own bytes,
    ///  e.g. the discovery handler.
    pub fn send_raw(&self, payload: &[u8], to: SocketAddr) -> Result<Option<usize>> {
        let socket = {
            let guard = self.socket.lock().unwrap();
            match guard.as_ref() {
                Some(socket) => socket.clone(),
                None => return Err(NetError::Cancelled),
            }
        };

        match socket.try_send_to(payload, to) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NetError::Io(e)),
        }
    }
}
