use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::BufMut;
use bytes_varint::VarIntSupportMut;
use tokio::net::TcpStream;
use tracing::trace;

use crate::buffers::FixedBuf;
use crate::connection::Connection;
use crate::convert::PrecheckedCast;
use crate::error::{NetError, Result};
use crate::serialization::{ObjectBox, Serialization};

pub(crate) const DEFAULT_KEEP_ALIVE_MILLIS: u64 = 8000;
pub(crate) const DEFAULT_TIMEOUT_MILLIS: u64 = 12000;
pub(crate) const DEFAULT_IDLE_THRESHOLD: f32 = 0.1;

/// The length prefix is a varint with 7 data bits per byte, so 5 bytes cover
///  the full `0..2^31-1` frame length range.
const MAX_LENGTH_PREFIX_BYTES: usize = 5;

/// Varint-prefixed object framing over one non-blocking TCP socket.
///
/// The read path decodes zero or more complete objects per readiness event,
///  buffering partial prefixes and partial payloads across events. The write
///  path queues serialized bytes in a bounded buffer and drains it
///  opportunistically; bytes that do not fit the socket's send buffer are
///  flushed on write readiness. A serialized object that does not fit into the
///  free write-buffer space is a [NetError::BufferOverflow], which the caller
///  treats as fatal for the connection.
pub struct TcpFramer {
    serialization: Arc<dyn Serialization>,
    socket: Mutex<Option<TcpStream>>,
    reader: Mutex<FrameReader>,
    writer: Mutex<FrameWriter>,
    timers: Mutex<Timers>,
    keep_alive_millis: AtomicU64,
    timeout_millis: AtomicU64,
    idle_threshold: AtomicU32,
}

struct FrameReader {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    /// payload length of the frame currently being assembled, once its prefix
    ///  is complete
    current_length: Option<usize>,
}

struct FrameWriter {
    /// bytes queued for the socket, frame prefixes included
    queued: FixedBuf,
    /// staging area for one serialized object, so the varint prefix can be
    ///  backfilled once the payload length is known
    scratch: FixedBuf,
}

struct Timers {
    last_read: Instant,
    last_write: Instant,
}

impl TcpFramer {
    pub fn new(serialization: Arc<dyn Serialization>, write_buffer_size: usize, object_buffer_size: usize) -> TcpFramer {
        let now = Instant::now();
        TcpFramer {
            serialization,
            socket: Mutex::new(None),
            reader: Mutex::new(FrameReader {
                buf: vec![0; object_buffer_size],
                start: 0,
                end: 0,
                current_length: None,
            }),
            writer: Mutex::new(FrameWriter {
                queued: FixedBuf::new(write_buffer_size),
                scratch: FixedBuf::new(object_buffer_size),
            }),
            timers: Mutex::new(Timers {
                last_read: now,
                last_write: now,
            }),
            keep_alive_millis: AtomicU64::new(DEFAULT_KEEP_ALIVE_MILLIS),
            timeout_millis: AtomicU64::new(DEFAULT_TIMEOUT_MILLIS),
            idle_threshold: AtomicU32::new(DEFAULT_IDLE_THRESHOLD.to_bits()),
        }
    }

    /// takes ownership of a freshly accepted socket
    pub fn attach(&self, socket: TcpStream) -> io::Result<()> {
        socket.set_nodelay(true)?;
        *self.socket.lock().unwrap() = Some(socket);

        let now = Instant::now();
        let mut timers = self.timers.lock().unwrap();
        timers.last_read = now;
        timers.last_write = now;
        Ok(())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().unwrap().as_ref().and_then(|s| s.peer_addr().ok())
    }

    pub fn close(&self) {
        // dropping the stream closes the socket
        let _ = self.socket.lock().unwrap().take();
    }

    /// Attempts to decode one object. Returns `Ok(None)` when no complete
    ///  frame is buffered and the socket has nothing more to offer; the event
    ///  loop calls this repeatedly until it does.
    pub fn read_object(&self, connection: Option<&Connection>) -> Result<Option<ObjectBox>> {
        let mut guard = self.reader.lock().unwrap();
        let r = &mut *guard;

        let length = match r.current_length {
            Some(length) => length,
            None => {
                // the prefix itself may arrive split across readiness events
                let mut parsed = parse_varint_prefix(&r.buf[r.start..r.end])?;
                if parsed.is_none() && self.fill(r)? {
                    parsed = parse_varint_prefix(&r.buf[r.start..r.end])?;
                }
                match parsed {
                    Some((length, prefix_length)) => {
                        r.start += prefix_length;
                        if length == 0 || length > r.buf.len() {
                            return Err(NetError::framing(format!("invalid object length: {}", length)));
                        }
                        r.current_length = Some(length);
                        length
                    }
                    None => return Ok(None),
                }
            }
        };

        if r.end - r.start < length {
            self.fill(r)?;
            if r.end - r.start < length {
                return Ok(None);
            }
        }

        let mut payload = &r.buf[r.start..r.start + length];
        let object = self.serialization.read_object(connection, &mut payload)?;
        if !payload.is_empty() {
            return Err(NetError::serialization(format!(
                "incorrect number of bytes used to deserialize object: {} of {} left over",
                payload.len(),
                length
            )));
        }
        r.start += length;
        r.current_length = None;
        if r.start == r.end {
            r.start = 0;
            r.end = 0;
        }
        Ok(Some(object))
    }

    /// top up the read buffer from the socket without blocking; returns
    ///  whether any bytes arrived
    fn fill(&self, r: &mut FrameReader) -> Result<bool> {
        if r.end == r.buf.len() {
            // the frame spans this fill, move it to the front
            r.buf.copy_within(r.start..r.end, 0);
            r.end -= r.start;
            r.start = 0;
            if r.end == r.buf.len() {
                return Ok(false);
            }
        }

        let guard = self.socket.lock().unwrap();
        let Some(socket) = guard.as_ref() else {
            return Err(NetError::Cancelled);
        };
        match socket.try_read(&mut r.buf[r.end..]) {
            Ok(0) => Err(NetError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by remote",
            ))),
            Ok(n) => {
                r.end += n;
                drop(guard);
                self.timers.lock().unwrap().last_read = Instant::now();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(NetError::Io(e)),
        }
    }

    /// Serializes one object and queues it for the socket. If the write buffer
    ///  was empty, as much as possible is written immediately; the remainder
    ///  is drained on write readiness. Returns the number of payload bytes
    ///  queued.
    pub fn send(&self, connection: Option<&Connection>, object: &dyn Any) -> Result<usize> {
        let mut guard = self.writer.lock().unwrap();
        let FrameWriter { queued, scratch } = &mut *guard;

        scratch.clear();
        self.serialization.write_object(connection, scratch, object)?;
        let payload_length = scratch.len();

        // backfill the prefix now that the payload length is known
        let mut prefix = [0u8; MAX_LENGTH_PREFIX_BYTES];
        let mut prefix_buf = &mut prefix[..];
        prefix_buf.put_u32_varint(payload_length.prechecked_cast());
        let prefix_length = MAX_LENGTH_PREFIX_BYTES - prefix_buf.remaining_mut();

        let free = queued.free();
        if prefix_length + payload_length > free {
            return Err(NetError::BufferOverflow {
                needed: prefix_length + payload_length,
                available: free,
            });
        }

        let was_empty = queued.is_empty();
        queued.put_slice(&prefix[..prefix_length]);
        queued.put_slice(scratch.as_ref());

        if was_empty {
            // the socket is usually writable, so try to hand the bytes to the
            //  kernel right away
            self.write_to_socket(queued)?;
        }
        Ok(payload_length)
    }

    /// invoked on write readiness: drains the write buffer to the socket
    pub fn write_operation(&self) -> Result<()> {
        let mut guard = self.writer.lock().unwrap();
        self.write_to_socket(&mut guard.queued)
    }

    fn write_to_socket(&self, queued: &mut FixedBuf) -> Result<()> {
        let guard = self.socket.lock().unwrap();
        let Some(socket) = guard.as_ref() else {
            return Err(NetError::Cancelled);
        };

        let mut written = 0;
        while written < queued.len() {
            match socket.try_write(&queued.as_ref()[written..]) {
                Ok(0) => {
                    return Err(NetError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(NetError::Io(e)),
            }
        }
        drop(guard);

        if written > 0 {
            queued.consume(written);
        }
        self.timers.lock().unwrap().last_write = Instant::now();
        Ok(())
    }

    pub fn needs_write(&self) -> bool {
        !self.writer.lock().unwrap().queued.is_empty()
    }

    /// the number of bytes waiting to be written to the socket
    pub fn queued_bytes(&self) -> usize {
        self.writer.lock().unwrap().queued.len()
    }

    /// Reports read readiness, and write readiness while bytes are queued.
    ///  A socket error is reported as readable so that it surfaces (and is
    ///  handled) on the read path.
    pub(crate) fn poll_readiness(&self, cx: &mut Context<'_>) -> Poll<(bool, bool)> {
        let wants_write = self.needs_write();

        let guard = self.socket.lock().unwrap();
        let Some(socket) = guard.as_ref() else {
            // closed concurrently; the registry catches up within this cycle
            return Poll::Pending;
        };

        let mut readable = false;
        let mut writable = false;
        match socket.poll_read_ready(cx) {
            Poll::Ready(Ok(())) => readable = true,
            Poll::Ready(Err(e)) => {
                trace!("read readiness error, deferring to the read path: {}", e);
                readable = true;
            }
            Poll::Pending => {}
        }
        if wants_write {
            match socket.poll_write_ready(cx) {
                Poll::Ready(Ok(())) => writable = true,
                Poll::Ready(Err(e)) => {
                    trace!("write readiness error, deferring to the write path: {}", e);
                    writable = true;
                }
                Poll::Pending => {}
            }
        }

        if readable || writable {
            Poll::Ready((readable, writable))
        } else {
            Poll::Pending
        }
    }

    pub fn set_keep_alive_millis(&self, millis: u64) {
        self.keep_alive_millis.store(millis, Ordering::Relaxed);
    }

    pub fn set_timeout_millis(&self, millis: u64) {
        self.timeout_millis.store(millis, Ordering::Relaxed);
    }

    pub fn set_idle_threshold(&self, threshold: f32) {
        self.idle_threshold.store(threshold.to_bits(), Ordering::Relaxed);
    }

    /// whether a keep-alive should be sent: only on a connection that has been
    ///  silent for the configured interval and has nothing queued
    pub fn needs_keep_alive(&self, now: Instant) -> bool {
        let keep_alive = self.keep_alive_millis.load(Ordering::Relaxed);
        if keep_alive == 0 || self.needs_write() {
            return false;
        }
        let last_write = self.timers.lock().unwrap().last_write;
        now.saturating_duration_since(last_write) > Duration::from_millis(keep_alive)
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        let timeout = self.timeout_millis.load(Ordering::Relaxed);
        if timeout == 0 {
            return false;
        }
        let last_read = self.timers.lock().unwrap().last_read;
        now.saturating_duration_since(last_read) > Duration::from_millis(timeout)
    }

    /// a connection is idle while its write buffer is below the idle threshold
    pub fn is_idle(&self) -> bool {
        let threshold = f32::from_bits(self.idle_threshold.load(Ordering::Relaxed));
        let writer = self.writer.lock().unwrap();
        (writer.queued.len() as f32) / (writer.queued.capacity() as f32) < threshold
    }

    #[cfg(test)]
    pub(crate) fn force_last_read(&self, instant: Instant) {
        self.timers.lock().unwrap().last_read = instant;
    }

    #[cfg(test)]
    pub(crate) fn force_last_write(&self, instant: Instant) {
        self.timers.lock().unwrap().last_write = instant;
    }

    #[cfg(test)]
    pub(crate) fn force_queued(&self, bytes: &[u8]) {
        self.writer.lock().unwrap().queued.put_slice(bytes);
    }
}

/// Parses a varint length prefix from the front of `bytes`. Returns the value
///  and the number of prefix bytes, or `None` while the prefix is incomplete.
fn parse_varint_prefix(bytes: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0u32;
    for (i, &b) in bytes.iter().take(MAX_LENGTH_PREFIX_BYTES).enumerate() {
        value |= u32::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            if i == MAX_LENGTH_PREFIX_BYTES - 1 && b > 0x07 {
                return Err(NetError::framing("length prefix out of range"));
            }
            return Ok(Some((value.prechecked_cast(), i + 1)));
        }
    }
    if bytes.len() >= MAX_LENGTH_PREFIX_BYTES {
        return Err(NetError::framing("length prefix longer than 5 bytes"));
    }
    Ok(None)
}
