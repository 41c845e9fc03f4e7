use std::any::Any;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::buffers::{CowList, CowMap};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::discovery::{DefaultDiscoveryHandler, ServerDiscoveryHandler};
use crate::error::{NetError, Result};
use crate::framework::FrameworkMessage;
use crate::listener::{Listener, ListenerSet};
use crate::serialization::Serialization;
use crate::udp_channel::UdpChannel;

/// Manages TCP and optionally UDP connections from many clients.
///
/// All protocol work happens in [update](Server::update), which one dedicated
///  task calls in a loop (see [run](Server::run) / [start](Server::start)).
///  The handle is cheap to clone; `bind`, `close`, `stop` and the `send_to*`
///  operations may be called from any task concurrently with the update loop.
#[derive(Clone)]
pub struct Server {
    state: Arc<ServerState>,
}

struct ServerState {
    config: ServerConfig,
    serialization: Arc<dyn Serialization>,
    tcp_listener: Mutex<Option<TcpListener>>,
    udp: Mutex<Option<Arc<UdpChannel>>>,
    /// established connections, newest first
    connections: CowList<Arc<Connection>>,
    /// accepted connections awaiting their UDP registration, by id
    pending_connections: CowMap<i32, Arc<Connection>>,
    listeners: ListenerSet,
    discovery_handler: Mutex<Arc<dyn ServerDiscoveryHandler>>,
    next_connection_id: AtomicI32,
    empty_selects: EmptySelectCounter,
    shutdown: AtomicBool,
    /// The update loop holds this lock for the duration of a cycle; `bind`
    ///  and `close` take it while they tear down or swap the sockets and the
    ///  registry, so their mutations interpose between cycles but never run
    ///  concurrently with one. A pending select is cut short via `wakeup` so
    ///  the lock frees promptly.
    update_lock: tokio::sync::Mutex<()>,
    wakeup: Notify,
}

/// one unit of readiness, the moral equivalent of a selection key
enum SelectKey {
    Accept(TcpStream, SocketAddr),
    Tcp {
        connection: Arc<Connection>,
        readable: bool,
        writable: bool,
    },
    Udp {
        from: SocketAddr,
    },
}

impl Server {
    /// Creates a server with the default buffer sizes.
    pub fn new(serialization: Arc<dyn Serialization>) -> Server {
        Server::with_config(ServerConfig::default(), serialization)
    }

    pub fn with_config(config: ServerConfig, serialization: Arc<dyn Serialization>) -> Server {
        Server {
            state: Arc::new(ServerState {
                config,
                serialization,
                tcp_listener: Mutex::new(None),
                udp: Mutex::new(None),
                connections: CowList::new(),
                pending_connections: CowMap::new(),
                listeners: ListenerSet::new(),
                discovery_handler: Mutex::new(Arc::new(DefaultDiscoveryHandler)),
                next_connection_id: AtomicI32::new(1),
                empty_selects: EmptySelectCounter::new(),
                shutdown: AtomicBool::new(false),
                update_lock: tokio::sync::Mutex::new(()),
                wakeup: Notify::new(),
            }),
        }
    }

    pub fn serialization(&self) -> &Arc<dyn Serialization> {
        &self.state.serialization
    }

    pub fn set_discovery_handler(&self, handler: Arc<dyn ServerDiscoveryHandler>) {
        *self.state.discovery_handler.lock().unwrap() = handler;
    }

    /// Opens the server: TCP only, or TCP and UDP. Closes any sockets from a
    ///  previous bind first; clients of a UDP-enabled server must register
    ///  UDP before they become visible.
    pub async fn bind(&self, tcp_addr: SocketAddr, udp_addr: Option<SocketAddr>) -> Result<()> {
        self.close().await;
        self.state.config.validate()?;

        self.state.wakeup.notify_waiters();
        let guard = self.state.update_lock.lock().await;
        match self.bind_sockets(tcp_addr, udp_addr).await {
            Ok(()) => {
                info!("server opened");
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.close().await;
                Err(e)
            }
        }
    }

    async fn bind_sockets(&self, tcp_addr: SocketAddr, udp_addr: Option<SocketAddr>) -> Result<()> {
        let listener = TcpListener::bind(tcp_addr).await?;
        debug!("accepting connections on {}/TCP", listener.local_addr()?);
        *self.state.tcp_listener.lock().unwrap() = Some(listener);

        if let Some(udp_addr) = udp_addr {
            let channel = UdpChannel::new(self.state.serialization.clone(), self.state.config.object_buffer_size);
            channel.bind(udp_addr).await?;
            if let Some(addr) = channel.local_addr() {
                debug!("accepting connections on {}/UDP", addr);
            }
            *self.state.udp.lock().unwrap() = Some(Arc::new(channel));
        }
        Ok(())
    }

    /// the bound TCP listening address, while the server is open
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.state.tcp_listener.lock().unwrap().as_ref().and_then(|l| l.local_addr().ok())
    }

    /// the bound UDP address, while the server is open with UDP
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.state.udp.lock().unwrap().as_ref().and_then(|u| u.local_addr())
    }

    /// Accepts any new connections and reads or writes any pending data for
    ///  the current connections.
    ///
    /// `timeout` bounds the wait for a connection to become ready to process;
    ///  zero polls once and returns immediately.
    pub async fn update(&self, timeout: Duration) -> Result<()> {
        // held for the whole cycle: a bind or close from another task
        // interposes between cycles, never mid-cycle
        let _guard = self.state.update_lock.lock().await;

        let start_time = Instant::now();
        let keys = self.state.select(timeout).await;

        if let Some(pause) = self.state.empty_selects.record(keys.len(), start_time.elapsed()) {
            tokio::time::sleep(pause).await;
        }

        if !keys.is_empty() {
            self.state.keep_alive();
            for key in keys {
                // long batches must not starve keep-alives
                self.state.keep_alive();
                match key {
                    SelectKey::Accept(socket, remote_addr) => self.state.accept_operation(socket, remote_addr),
                    SelectKey::Tcp {
                        connection,
                        readable,
                        writable,
                    } => self.state.tcp_operation(&connection, readable, writable),
                    SelectKey::Udp { from } => self.state.udp_operation(from),
                }
            }
        }

        let now = Instant::now();
        for connection in self.state.connections.snapshot().iter() {
            if connection.tcp.is_timed_out(now) {
                debug!("{} timed out", connection);
                connection.close();
            } else if connection.tcp.needs_keep_alive(now) {
                connection.send_tcp(&FrameworkMessage::KeepAlive);
            }
            if connection.is_idle() {
                connection.notify_idle();
            }
        }
        Ok(())
    }

    /// Runs update cycles until [stop](Server::stop); an error that escapes
    ///  `update` closes the server and ends the loop.
    pub async fn run(&self) {
        trace!("server task started");
        self.state.shutdown.store(false, Ordering::Release);
        while !self.state.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.update(Duration::from_millis(250)).await {
                error!("error updating server connections: {}", e);
                self.close().await;
                break;
            }
        }
        trace!("server task stopped");
    }

    /// Spawns a task that calls [run](Server::run). Call one of the `bind`
    ///  methods before starting the server.
    pub fn start(&self) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move { server.run().await })
    }

    pub async fn stop(&self) {
        if self.state.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("server task stopping");
        self.close().await;
    }

    /// Closes all open connections and the server sockets. The teardown takes
    ///  the update lock, so it interposes between update cycles rather than
    ///  racing one that is mid-flight.
    pub async fn close(&self) {
        // cut a pending select short so the update lock frees promptly
        self.state.wakeup.notify_waiters();
        let _guard = self.state.update_lock.lock().await;

        let connections = self.state.connections.snapshot();
        let pending: Vec<Arc<Connection>> = self.state.pending_connections.snapshot().values().cloned().collect();
        if !connections.is_empty() || !pending.is_empty() {
            info!("closing server connections...");
        }
        for connection in connections.iter() {
            connection.close();
        }
        for connection in pending {
            connection.close();
        }

        if self.state.tcp_listener.lock().unwrap().take().is_some() {
            info!("server closed");
        }
        if let Some(udp) = self.state.udp.lock().unwrap().take() {
            udp.close();
        }
    }

    /// a snapshot of the established connections, newest first
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.connections.snapshot().as_ref().clone()
    }

    /// Should be called before [bind](Server::bind); a listener that was
    ///  already added is ignored.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.state.listeners.add(listener);
        trace!("server listener added");
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        self.state.listeners.remove(listener);
        trace!("server listener removed");
    }

    pub fn send_to_all_tcp(&self, object: &dyn Any) {
        for connection in self.state.connections.snapshot().iter() {
            connection.send_tcp(object);
        }
    }

    pub fn send_to_all_except_tcp(&self, connection_id: i32, object: &dyn Any) {
        for connection in self.state.connections.snapshot().iter() {
            if connection.id() != connection_id {
                connection.send_tcp(object);
            }
        }
    }

    /// Sends to the connection with the given id; returns the payload bytes
    ///  queued, 0 if the send failed or no such connection exists.
    pub fn send_to_tcp(&self, connection_id: i32, object: &dyn Any) -> usize {
        for connection in self.state.connections.snapshot().iter() {
            if connection.id() == connection_id {
                return connection.send_tcp(object);
            }
        }
        0
    }

    pub fn send_to_all_udp(&self, object: &dyn Any) {
        for connection in self.state.connections.snapshot().iter() {
            connection.send_udp(object);
        }
    }

    pub fn send_to_all_except_udp(&self, connection_id: i32, object: &dyn Any) {
        for connection in self.state.connections.snapshot().iter() {
            if connection.id() != connection_id {
                connection.send_udp(object);
            }
        }
    }

    pub fn send_to_udp(&self, connection_id: i32, object: &dyn Any) -> usize {
        for connection in self.state.connections.snapshot().iter() {
            if connection.id() == connection_id {
                return connection.send_udp(object);
            }
        }
        0
    }
}

impl ServerState {
    /// Collects all currently ready keys, waiting at most `timeout`. A wakeup
    ///  from another task ends the wait early with no keys.
    async fn select(&self, timeout: Duration) -> Vec<SelectKey> {
        let connections: Vec<Arc<Connection>> = {
            let established = self.connections.snapshot();
            let pending = self.pending_connections.snapshot();
            established.iter().cloned().chain(pending.values().cloned()).collect()
        };
        let mut ready = poll_fn(|cx| self.poll_keys(cx, &connections));

        if timeout.is_zero() {
            return tokio::select! { biased;
                keys = &mut ready => keys,
                _ = std::future::ready(()) => Vec::new(),
            };
        }
        tokio::select! {
            keys = &mut ready => keys,
            _ = self.wakeup.notified() => Vec::new(),
            _ = tokio::time::sleep(timeout) => Vec::new(),
        }
    }

    fn poll_keys(&self, cx: &mut Context<'_>, connections: &[Arc<Connection>]) -> Poll<Vec<SelectKey>> {
        let mut keys = Vec::new();

        {
            let guard = self.tcp_listener.lock().unwrap();
            if let Some(listener) = guard.as_ref() {
                match listener.poll_accept(cx) {
                    Poll::Ready(Ok((socket, remote_addr))) => keys.push(SelectKey::Accept(socket, remote_addr)),
                    // the listening socket stays open
                    Poll::Ready(Err(e)) => debug!("unable to accept new connection: {}", e),
                    Poll::Pending => {}
                }
            }
        }

        let udp = self.udp.lock().unwrap().clone();
        if let Some(udp) = udp {
            match udp.poll_recv_from(cx) {
                Poll::Ready(Ok(from)) => keys.push(SelectKey::Udp { from }),
                // logged and discarded, the channel stays open
                Poll::Ready(Err(e)) => warn!("error reading UDP data: {}", e),
                Poll::Pending => {}
            }
        }

        for connection in connections {
            if let Poll::Ready((readable, writable)) = connection.tcp.poll_readiness(cx) {
                keys.push(SelectKey::Tcp {
                    connection: connection.clone(),
                    readable,
                    writable,
                });
            }
        }

        if keys.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(keys)
        }
    }

    fn accept_operation(self: &Arc<Self>, socket: TcpStream, remote_addr: SocketAddr) {
        let udp = self.udp.lock().unwrap().clone();

        let id = self.allocate_connection_id();
        let connection = Arc::new(Connection::new(
            id,
            self.serialization.clone(),
            self.config.write_buffer_size,
            self.config.object_buffer_size,
            udp.clone(),
        ));

        if let Err(e) = connection.tcp.attach(socket) {
            debug!("unable to accept TCP connection: {}", e);
            return;
        }
        trace!("accepted connection from {}", remote_addr);

        connection.set_connected(true);
        connection.add_listener(Arc::new(DispatchListener {
            state: Arc::downgrade(self),
        }));

        if udp.is_none() {
            self.add_connection(connection.clone());
        } else {
            self.pending_connections.insert(id, connection.clone());
        }

        connection.send_tcp(&FrameworkMessage::RegisterTcp { connection_id: id });

        if udp.is_none() {
            connection.notify_connected();
        }
    }

    fn tcp_operation(&self, connection: &Arc<Connection>, readable: bool, writable: bool) {
        if self.udp.lock().unwrap().is_some() && connection.remote_addr_udp().is_none() {
            // traffic on the TCP side before the UDP registration completed:
            // the handshake was violated, drop the connection
            connection.close();
            return;
        }
        if readable {
            loop {
                match connection.tcp.read_object(Some(connection)) {
                    Ok(Some(object)) => {
                        if object.downcast_ref::<FrameworkMessage>().is_some() {
                            trace!("{} received TCP: framework message", connection);
                        } else {
                            debug!("{} received TCP object", connection);
                        }
                        connection.notify_received(object);
                    }
                    Ok(None) => break,
                    Err(e @ NetError::Io(_)) | Err(e @ NetError::Cancelled) => {
                        trace!("unable to read TCP from {}: {}", connection, e);
                        connection.close();
                        return;
                    }
                    Err(e) => {
                        error!("error reading TCP from connection {}: {}", connection, e);
                        connection.record_protocol_error(Arc::new(e));
                        connection.close();
                        return;
                    }
                }
            }
        }
        if writable {
            if let Err(e) = connection.tcp.write_operation() {
                trace!("unable to write TCP to connection {}: {}", connection, e);
                connection.close();
            }
        }
    }

    fn udp_operation(self: &Arc<Self>, from: SocketAddr) {
        let udp = self.udp.lock().unwrap().clone();
        let Some(udp) = udp else { return };

        let from_connection = self
            .connections
            .snapshot()
            .iter()
            .find(|c| c.remote_addr_udp() == Some(from))
            .cloned();

        let object = match udp.read_object(from_connection.as_deref()) {
            Ok(object) => object,
            Err(e) => {
                match &from_connection {
                    Some(connection) => error!("error reading UDP from connection {}: {}", connection, e),
                    None => warn!("error reading UDP from unregistered address {}: {}", from, e),
                }
                return;
            }
        };

        if let Some(message) = object.downcast_ref::<FrameworkMessage>() {
            match *message {
                FrameworkMessage::RegisterUdp { connection_id } => {
                    // store the source address on the pending connection and
                    // acknowledge over TCP
                    match self.pending_connections.remove(&connection_id) {
                        Some(connection) => {
                            if connection.remote_addr_udp().is_some() {
                                return;
                            }
                            connection.set_udp_remote_addr(from);
                            self.add_connection(connection.clone());
                            connection.send_tcp(&FrameworkMessage::RegisterUdp { connection_id });
                            debug!("UDP connected to {}", from);
                            connection.notify_connected();
                        }
                        None => debug!("ignoring incoming RegisterUDP with invalid connection id: {}", connection_id),
                    }
                    return;
                }
                FrameworkMessage::DiscoverHost => {
                    let handler = self.discovery_handler.lock().unwrap().clone();
                    match handler.on_discover_host(&udp, from) {
                        Ok(true) => debug!("responded to host discovery from {}", from),
                        Ok(false) => {}
                        Err(e) => warn!("error replying to host discovery from {}: {}", from, e),
                    }
                    return;
                }
                _ => {}
            }
        }

        match from_connection {
            Some(connection) => {
                trace!("{} received UDP object", connection);
                connection.notify_received(object);
            }
            None => debug!("ignoring UDP from unregistered address: {}", from),
        }
    }

    /// one keep-alive pass across the established connections
    fn keep_alive(&self) {
        let now = Instant::now();
        for connection in self.connections.snapshot().iter() {
            if connection.tcp.needs_keep_alive(now) {
                connection.send_tcp(&FrameworkMessage::KeepAlive);
            }
        }
    }

    fn allocate_connection_id(&self) -> i32 {
        self.next_connection_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(next_connection_id_after(id)))
            .unwrap_or_else(|id| id)
    }

    fn add_connection(&self, connection: Arc<Connection>) {
        self.connections.update(move |connections| connections.insert(0, connection));
    }

    fn remove_connection(&self, connection: &Arc<Connection>) {
        self.connections
            .update(|connections| connections.retain(|other| !Arc::ptr_eq(other, connection)));
        self.pending_connections.remove(&connection.id());
    }
}

/// ids are positive, unique among live connections, and wrap from `i32::MAX`
///  back to 1 - 0 and negatives are never assigned
fn next_connection_id_after(id: i32) -> i32 {
    if id == i32::MAX {
        1
    } else {
        id + 1
    }
}

/// Some readiness layers are known to report no ready keys over and over
///  without waiting out the timeout; after enough consecutive empty selects
///  the loop backs off briefly to keep from hogging the CPU.
struct EmptySelectCounter {
    consecutive: AtomicU32,
}

impl EmptySelectCounter {
    const THRESHOLD: u32 = 100;
    const PAUSE: Duration = Duration::from_millis(25);

    fn new() -> EmptySelectCounter {
        EmptySelectCounter {
            consecutive: AtomicU32::new(0),
        }
    }

    /// records the outcome of one select; returns the pause to insert, if any
    fn record(&self, ready_keys: usize, elapsed: Duration) -> Option<Duration> {
        if ready_keys > 0 {
            self.consecutive.store(0, Ordering::Relaxed);
            return None;
        }
        let consecutive = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive < Self::THRESHOLD {
            return None;
        }
        self.consecutive.store(0, Ordering::Relaxed);
        Self::PAUSE.checked_sub(elapsed).filter(|pause| !pause.is_zero())
    }

    #[cfg(test)]
    fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::Relaxed)
    }
}

/// Attached to every accepted connection: removes it from the registry on
///  disconnect and fans events out to the server listeners.
struct DispatchListener {
    state: Weak<ServerState>,
}

impl Listener for DispatchListener {
    fn connected(&self, connection: &Arc<Connection>) {
        let Some(state) = self.state.upgrade() else { return };
        for listener in state.listeners.snapshot().iter() {
            listener.connected(connection);
        }
    }

    fn disconnected(&self, connection: &Arc<Connection>) {
        let Some(state) = self.state.upgrade() else { return };
        state.remove_connection(connection);
        for listener in state.listeners.snapshot().iter() {
            listener.disconnected(connection);
        }
    }

    fn received(&self, connection: &Arc<Connection>, object: &(dyn Any + Send)) {
        let Some(state) = self.state.upgrade() else { return };
        for listener in state.listeners.snapshot().iter() {
            listener.received(connection, object);
        }
    }

    fn idle(&self, connection: &Arc<Connection>) {
        let Some(state) = self.state.upgrade() else { return };
        for listener in state.listeners.snapshot().iter() {
            listener.idle(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::serialization::MockSerialization;

    use super::*;

    #[rstest]
    #[case::first(1, 2)]
    #[case::ordinary(41, 42)]
    #[case::just_below_wrap(i32::MAX - 1, i32::MAX)]
    #[case::wrap(i32::MAX, 1)]
    fn test_next_connection_id_after(#[case] id: i32, #[case] expected: i32) {
        assert_eq!(next_connection_id_after(id), expected);
    }

    #[test]
    fn test_allocated_ids_stay_positive_across_wrap() {
        let server = Server::new(Arc::new(MockSerialization::new()));
        server.state.next_connection_id.store(i32::MAX, Ordering::Relaxed);

        assert_eq!(server.state.allocate_connection_id(), i32::MAX);
        assert_eq!(server.state.allocate_connection_id(), 1);
        assert_eq!(server.state.allocate_connection_id(), 2);
    }

    #[test]
    fn test_empty_select_counter_pauses_after_threshold() {
        let counter = EmptySelectCounter::new();

        for _ in 0..99 {
            assert_eq!(counter.record(0, Duration::from_millis(1)), None);
        }
        assert_eq!(
            counter.record(0, Duration::from_millis(5)),
            Some(Duration::from_millis(20))
        );
        assert_eq!(counter.consecutive(), 0);
    }

    #[test]
    fn test_empty_select_counter_resets_on_ready_keys() {
        let counter = EmptySelectCounter::new();

        for _ in 0..99 {
            counter.record(0, Duration::ZERO);
        }
        assert_eq!(counter.record(3, Duration::ZERO), None);
        assert_eq!(counter.consecutive(), 0);

        // the run starts over
        for _ in 0..99 {
            assert_eq!(counter.record(0, Duration::ZERO), None);
        }
        assert!(counter.record(0, Duration::ZERO).is_some());
    }

    #[test]
    fn test_empty_select_counter_skips_pause_when_already_late() {
        let counter = EmptySelectCounter::new();

        for _ in 0..99 {
            counter.record(0, Duration::ZERO);
        }
        assert_eq!(counter.record(0, Duration::from_millis(30)), None);
        assert_eq!(counter.consecutive(), 0);
    }
}
