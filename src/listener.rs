use std::any::Any;
use std::sync::Arc;

use crate::buffers::CowList;
use crate::connection::Connection;

/// Callbacks for connection events. All of them are invoked from the I/O task
///  that drives the event loop, so they must not block; offload non-trivial
///  work to another task.
///
/// The default implementations do nothing, so implementors override only what
///  they care about.
pub trait Listener: Send + Sync + 'static {
    /// the connection transitioned to established; fires exactly once per
    ///  connection
    fn connected(&self, _connection: &Arc<Connection>) {}

    /// the connection was closed; fires exactly once for every connection
    ///  that was observed connected
    fn disconnected(&self, _connection: &Arc<Connection>) {}

    /// one decoded object arrived. Framework messages are mostly intercepted
    ///  before this fires; `Ping` and `KeepAlive` are still passed through and
    ///  are typically ignored here.
    fn received(&self, _connection: &Arc<Connection>, _object: &(dyn Any + Send)) {}

    /// the connection's write buffer is below the idle threshold; fires once
    ///  per update cycle while that holds
    fn idle(&self, _connection: &Arc<Connection>) {}
}

/// An ordered set of listeners: registration order, deduplicated by identity.
///  Mutation swaps in a fresh copy-on-write snapshot; event dispatch iterates
///  a snapshot without holding any lock.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: CowList<Arc<dyn Listener>>,
}

impl ListenerSet {
    pub fn new() -> ListenerSet {
        ListenerSet {
            listeners: CowList::new(),
        }
    }

    /// adds a listener; if the same instance was already added it is ignored
    pub fn add(&self, listener: Arc<dyn Listener>) {
        self.listeners.update(|listeners| {
            if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                listeners.push(listener.clone());
            }
        });
    }

    pub fn remove(&self, listener: &Arc<dyn Listener>) {
        self.listeners.update(|listeners| {
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
        });
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Listener>>> {
        self.listeners.snapshot()
    }
}
