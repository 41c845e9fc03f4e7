use std::any::Any;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error, info, trace};

use crate::error::NetError;
use crate::framework::FrameworkMessage;
use crate::listener::{Listener, ListenerSet};
use crate::serialization::{ObjectBox, Serialization};
use crate::tcp_framer::TcpFramer;
use crate::udp_channel::UdpChannel;

/// One client session: a TCP framer, optionally a registered UDP remote
///  address on the shared datagram channel, listeners, and timers.
///
/// A connection is in exactly one of three states: *pending* (TCP up, UDP
///  bind awaited), *established* (registered with the server), or *closed*
///  (terminal). Two handles are equal only if they are the same instance;
///  ids are reused after wrap-around, so id equality would lie eventually.
pub struct Connection {
    id: i32,
    name: Mutex<Option<String>>,
    pub(crate) tcp: TcpFramer,
    udp: Option<Arc<UdpChannel>>,
    udp_remote_addr: Mutex<Option<SocketAddr>>,
    listeners: ListenerSet,
    is_connected: AtomicBool,
    last_protocol_error: Mutex<Option<Arc<NetError>>>,
    ping: Mutex<PingState>,
}

struct PingState {
    last_ping_id: i32,
    last_ping_send_time: Instant,
    return_trip_time_millis: i64,
}

impl Connection {
    pub(crate) fn new(
        id: i32,
        serialization: Arc<dyn Serialization>,
        write_buffer_size: usize,
        object_buffer_size: usize,
        udp: Option<Arc<UdpChannel>>,
    ) -> Connection {
        Connection {
            id,
            name: Mutex::new(None),
            tcp: TcpFramer::new(serialization, write_buffer_size, object_buffer_size),
            udp,
            udp_remote_addr: Mutex::new(None),
            listeners: ListenerSet::new(),
            is_connected: AtomicBool::new(false),
            last_protocol_error: Mutex::new(None),
            ping: Mutex::new(PingState {
                last_ping_id: 0,
                last_ping_send_time: Instant::now(),
                return_trip_time_millis: -1,
            }),
        }
    }

    /// the server-assigned id; stable for the lifetime of this connection
    pub fn id(&self) -> i32 {
        self.id
    }

    /// whether this connection is connected to the remote end; it can become
    ///  disconnected at any time
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    /// the last framing / serialization error observed on this connection, if
    ///  any
    pub fn last_protocol_error(&self) -> Option<Arc<NetError>> {
        self.last_protocol_error.lock().unwrap().clone()
    }

    pub(crate) fn record_protocol_error(&self, error: Arc<NetError>) {
        *self.last_protocol_error.lock().unwrap() = Some(error);
    }

    /// Sends the object over TCP. Returns the number of payload bytes queued;
    ///  0 means the send failed (and closed the connection) or there was
    ///  nothing to send.
    pub fn send_tcp(self: &Arc<Self>, object: &dyn Any) -> usize {
        match self.tcp.send(Some(self), object) {
            Ok(length) => {
                if length == 0 {
                    trace!("{} TCP had nothing to send", self);
                } else {
                    trace!("{} sent TCP ({} bytes)", self, length);
                }
                length
            }
            Err(e) => {
                debug!("unable to send TCP with connection {}: {}", self, e);
                self.close();
                0
            }
        }
    }

    /// Sends the object over UDP. Returns the number of payload bytes handed
    ///  to the kernel; 0 means the datagram was dropped locally or the send
    ///  failed. A send on a connection without a registered UDP side is one
    ///  of the zero-return cases (logged, no typed error), like every other
    ///  locally failed send.
    pub fn send_udp(self: &Arc<Self>, object: &dyn Any) -> usize {
        let address = *self.udp_remote_addr.lock().unwrap();
        let Some(udp) = self.udp.as_ref() else {
            error!("{}: UDP send on a connection without UDP", self);
            return 0;
        };
        let Some(address) = address else {
            if self.is_connected() {
                error!("{}: UDP send before the remote registered UDP", self);
            } else {
                debug!("{}: UDP send on a closed connection", self);
            }
            return 0;
        };

        match udp.send(Some(self), object, address) {
            Ok(Some(length)) => {
                trace!("{} sent UDP ({} bytes)", self, length);
                length
            }
            Ok(None) => {
                debug!("{} was unable to send, UDP socket buffer full", self);
                0
            }
            Err(e) => {
                debug!("unable to send UDP with connection {}: {}", self, e);
                self.close();
                0
            }
        }
    }

    /// Closes the connection. `disconnected` fires exactly once iff the
    ///  connection was observed connected.
    pub fn close(self: &Arc<Self>) {
        let was_connected = self.is_connected.swap(false, Ordering::AcqRel);
        self.tcp.close();
        if was_connected {
            self.notify_disconnected();
            info!("{} disconnected", self);
        }
    }

    /// Sends a ping; once the matching reply arrives, a fresh
    ///  [return_trip_time](Connection::return_trip_time) is available.
    pub fn update_return_trip_time(self: &Arc<Self>) {
        let id = {
            let mut ping = self.ping.lock().unwrap();
            let id = ping.last_ping_id;
            ping.last_ping_id += 1;
            ping.last_ping_send_time = Instant::now();
            id
        };
        self.send_tcp(&FrameworkMessage::Ping { id, is_reply: false });
    }

    /// the last measured TCP round trip in milliseconds, or -1 before the
    ///  first ping reply
    pub fn return_trip_time(&self) -> i64 {
        self.ping.lock().unwrap().return_trip_time_millis
    }

    /// An empty framework message is sent if the TCP connection has not sent
    ///  an object within this interval, so that intermediaries keep the
    ///  connection up and a dead peer is detected in a reasonable amount of
    ///  time. 0 disables. Defaults to 8000.
    pub fn set_keep_alive_tcp(&self, keep_alive_millis: u64) {
        self.tcp.set_keep_alive_millis(keep_alive_millis);
    }

    /// If this amount of time passes without receiving an object over TCP,
    ///  the connection is considered broken and closed. Set it higher than
    ///  the remote end's keep-alive interval to allow for latency. 0
    ///  disables. Defaults to 12000.
    pub fn set_timeout(&self, timeout_millis: u64) {
        self.tcp.set_timeout_millis(timeout_millis);
    }

    /// While the filled fraction of the write buffer is below this threshold,
    ///  `idle` fires once per update cycle. Defaults to 0.1.
    pub fn set_idle_threshold(&self, idle_threshold: f32) {
        self.tcp.set_idle_threshold(idle_threshold);
    }

    pub fn is_idle(&self) -> bool {
        self.tcp.is_idle()
    }

    /// the number of bytes waiting to be written to the TCP socket
    pub fn tcp_write_buffer_size(&self) -> usize {
        self.tcp.queued_bytes()
    }

    /// adds a listener; a listener that was already added is ignored
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.add(listener);
        trace!("connection listener added");
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        self.listeners.remove(listener);
        trace!("connection listener removed");
    }

    /// the remote end of the TCP connection, while it is open
    pub fn remote_addr_tcp(&self) -> Option<SocketAddr> {
        self.tcp.remote_addr()
    }

    /// the registered UDP remote address; non-null iff UDP registration
    ///  completed for this connection
    pub fn remote_addr_udp(&self) -> Option<SocketAddr> {
        *self.udp_remote_addr.lock().unwrap()
    }

    pub(crate) fn set_udp_remote_addr(&self, addr: SocketAddr) {
        *self.udp_remote_addr.lock().unwrap() = Some(addr);
    }

    /// Sets the friendly name used in log output. Defaults to
    ///  `Connection <id>` once connected.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = Some(name.into());
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.is_connected.store(connected, Ordering::Release);
        if connected {
            let mut name = self.name.lock().unwrap();
            if name.is_none() {
                *name = Some(format!("Connection {}", self.id));
            }
        }
    }

    pub(crate) fn notify_connected(self: &Arc<Self>) {
        if let Some(addr) = self.remote_addr_tcp() {
            info!("{} connected: {}", self, addr.ip());
        }
        for listener in self.listeners.snapshot().iter() {
            listener.connected(self);
        }
    }

    pub(crate) fn notify_disconnected(self: &Arc<Self>) {
        for listener in self.listeners.snapshot().iter() {
            listener.disconnected(self);
        }
    }

    pub(crate) fn notify_idle(self: &Arc<Self>) {
        for listener in self.listeners.snapshot().iter() {
            listener.idle(self);
            if !self.is_idle() {
                break;
            }
        }
    }

    pub(crate) fn notify_received(self: &Arc<Self>, object: ObjectBox) {
        if let Some(&FrameworkMessage::Ping { id, is_reply }) = object.downcast_ref::<FrameworkMessage>() {
            if is_reply {
                let mut ping = self.ping.lock().unwrap();
                if id == ping.last_ping_id - 1 {
                    ping.return_trip_time_millis = ping.last_ping_send_time.elapsed().as_millis() as i64;
                    trace!("{} return trip time: {}", self, ping.return_trip_time_millis);
                }
            } else {
                self.send_tcp(&FrameworkMessage::Ping { id, is_reply: true });
            }
        }
        for listener in self.listeners.snapshot().iter() {
            listener.received(self, &*object);
        }
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &*self.name.lock().unwrap() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "Connection {}", self.id),
        }
    }
}
