//! Test support: a tag-based serialization, raw-socket client helpers, and a
//!  listener that records events for assertions.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut};
use bytes_varint::VarIntSupportMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use objnet::buffers::FixedBuf;
use objnet::{Connection, FrameworkMessage, Listener, NetError, ObjectBox, Serialization};

const TAG_REGISTER_TCP: u8 = 0x01;
const TAG_REGISTER_UDP: u8 = 0x02;
const TAG_KEEP_ALIVE: u8 = 0x03;
const TAG_PING: u8 = 0x04;
const TAG_DISCOVER_HOST: u8 = 0x05;
const TAG_STRING: u8 = 0x10;

/// One-byte tag followed by the payload; strings take the rest of the buffer.
pub struct TestSerialization;

impl Serialization for TestSerialization {
    fn write_object(&self, _connection: Option<&Connection>, target: &mut FixedBuf, object: &dyn Any) -> objnet::Result<()> {
        if let Some(message) = object.downcast_ref::<FrameworkMessage>() {
            match *message {
                FrameworkMessage::RegisterTcp { connection_id } => {
                    ensure(target, 5)?;
                    target.put_u8(TAG_REGISTER_TCP);
                    target.put_i32(connection_id);
                }
                FrameworkMessage::RegisterUdp { connection_id } => {
                    ensure(target, 5)?;
                    target.put_u8(TAG_REGISTER_UDP);
                    target.put_i32(connection_id);
                }
                FrameworkMessage::KeepAlive => {
                    ensure(target, 1)?;
                    target.put_u8(TAG_KEEP_ALIVE);
                }
                FrameworkMessage::Ping { id, is_reply } => {
                    ensure(target, 6)?;
                    target.put_u8(TAG_PING);
                    target.put_i32(id);
                    target.put_u8(is_reply as u8);
                }
                FrameworkMessage::DiscoverHost => {
                    ensure(target, 1)?;
                    target.put_u8(TAG_DISCOVER_HOST);
                }
            }
            return Ok(());
        }
        if let Some(text) = object.downcast_ref::<String>() {
            ensure(target, 1 + text.len())?;
            target.put_u8(TAG_STRING);
            target.put_slice(text.as_bytes());
            return Ok(());
        }
        Err(NetError::serialization("unsupported object type"))
    }

    fn read_object(&self, _connection: Option<&Connection>, source: &mut &[u8]) -> objnet::Result<ObjectBox> {
        if source.is_empty() {
            return Err(NetError::serialization("empty payload"));
        }
        match source.get_u8() {
            TAG_REGISTER_TCP => Ok(Box::new(FrameworkMessage::RegisterTcp {
                connection_id: get_i32(source)?,
            })),
            TAG_REGISTER_UDP => Ok(Box::new(FrameworkMessage::RegisterUdp {
                connection_id: get_i32(source)?,
            })),
            TAG_KEEP_ALIVE => Ok(Box::new(FrameworkMessage::KeepAlive)),
            TAG_PING => {
                let id = get_i32(source)?;
                let is_reply = get_u8(source)? != 0;
                Ok(Box::new(FrameworkMessage::Ping { id, is_reply }))
            }
            TAG_DISCOVER_HOST => Ok(Box::new(FrameworkMessage::DiscoverHost)),
            TAG_STRING => {
                let rest = std::mem::take(source);
                match std::str::from_utf8(rest) {
                    Ok(text) => Ok(Box::new(text.to_string())),
                    Err(e) => Err(NetError::serialization(format!("invalid utf-8: {}", e))),
                }
            }
            tag => Err(NetError::serialization(format!("unknown tag: {}", tag))),
        }
    }
}

fn ensure(target: &FixedBuf, needed: usize) -> objnet::Result<()> {
    if target.free() < needed {
        return Err(NetError::BufferOverflow {
            needed,
            available: target.free(),
        });
    }
    Ok(())
}

fn get_i32(buf: &mut &[u8]) -> objnet::Result<i32> {
    if buf.remaining() < 4 {
        return Err(NetError::serialization("truncated i32"));
    }
    Ok(buf.get_i32())
}

fn get_u8(buf: &mut &[u8]) -> objnet::Result<u8> {
    if buf.remaining() < 1 {
        return Err(NetError::serialization("truncated u8"));
    }
    Ok(buf.get_u8())
}

/// one serialized object, as it travels in a datagram
pub fn encode_object(object: &dyn Any) -> Vec<u8> {
    let mut buf = FixedBuf::new(2048);
    TestSerialization
        .write_object(None, &mut buf, object)
        .expect("test object must serialize");
    buf.as_ref().to_vec()
}

/// one `<varint length><payload>` frame, as it travels in the TCP stream
pub fn encode_frame(object: &dyn Any) -> Vec<u8> {
    let payload = encode_object(object);
    let mut frame = Vec::new();
    frame.put_u32_varint(payload.len() as u32);
    frame.extend_from_slice(&payload);
    frame
}

/// reads one frame payload from the stream, blocking until it is complete
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let b = stream.read_u8().await.expect("stream closed while reading a frame prefix");
        length |= ((b & 0x7f) as usize) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut payload = vec![0; length];
    stream
        .read_exact(&mut payload)
        .await
        .expect("stream closed while reading a frame payload");
    payload
}

pub async fn read_object_frame<S: AsyncRead + Unpin>(stream: &mut S) -> ObjectBox {
    let payload = read_frame(stream).await;
    let mut source = payload.as_slice();
    let object = TestSerialization
        .read_object(None, &mut source)
        .expect("received frame must deserialize");
    assert!(source.is_empty(), "frame carried trailing bytes");
    object
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Connected(i32),
    Disconnected(i32),
    Received(i32, String),
}

/// Records connection events on a channel and keeps the connection handles
///  around for assertions. An optional hook configures each connection from
///  the `connected` callback, i.e. on the update task.
pub struct RecordingListener {
    events: UnboundedSender<Event>,
    connections: Mutex<Vec<Arc<Connection>>>,
    configure: Option<Box<dyn Fn(&Arc<Connection>) + Send + Sync>>,
}

impl RecordingListener {
    pub fn new() -> (Arc<RecordingListener>, UnboundedReceiver<Event>) {
        Self::create(None)
    }

    pub fn with_configure(
        configure: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> (Arc<RecordingListener>, UnboundedReceiver<Event>) {
        Self::create(Some(Box::new(configure)))
    }

    fn create(
        configure: Option<Box<dyn Fn(&Arc<Connection>) + Send + Sync>>,
    ) -> (Arc<RecordingListener>, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        (
            Arc::new(RecordingListener {
                events: tx,
                connections: Mutex::new(Vec::new()),
                configure,
            }),
            rx,
        )
    }

    /// the connection handle for the given id, as seen in `connected`
    pub fn connection(&self, id: i32) -> Arc<Connection> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .unwrap_or_else(|| panic!("no connection with id {} was seen", id))
    }
}

impl Listener for RecordingListener {
    fn connected(&self, connection: &Arc<Connection>) {
        if let Some(configure) = &self.configure {
            configure(connection);
        }
        self.connections.lock().unwrap().push(connection.clone());
        let _ = self.events.send(Event::Connected(connection.id()));
    }

    fn disconnected(&self, connection: &Arc<Connection>) {
        let _ = self.events.send(Event::Disconnected(connection.id()));
    }

    fn received(&self, connection: &Arc<Connection>, object: &(dyn Any + Send)) {
        let repr = if let Some(message) = object.downcast_ref::<FrameworkMessage>() {
            format!("{:?}", message)
        } else if let Some(text) = object.downcast_ref::<String>() {
            text.clone()
        } else {
            "<unknown>".to_string()
        };
        let _ = self.events.send(Event::Received(connection.id(), repr));
    }
}

pub async fn expect_event(events: &mut UnboundedReceiver<Event>, expected: Event) {
    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Some(event)) => assert_eq!(event, expected),
        Ok(None) => panic!("event channel closed while waiting for {:?}", expected),
        Err(_) => panic!("timed out waiting for {:?}", expected),
    }
}

pub async fn expect_no_event(events: &mut UnboundedReceiver<Event>, for_millis: u64) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(for_millis), events.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}
