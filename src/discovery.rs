use std::net::SocketAddr;

use crate::error::Result;
use crate::udp_channel::UdpChannel;

/// Policy for answering `DiscoverHost` broadcasts. The handler may send an
///  application-defined response datagram directly on the channel; no
///  connection state is involved.
pub trait ServerDiscoveryHandler: Send + Sync + 'static {
    /// Called for every `DiscoverHost` datagram, with the source address of
    ///  the datagram. Returns whether a response was sent.
    fn on_discover_host(&self, udp: &UdpChannel, from: SocketAddr) -> Result<bool>;
}

/// Replies with an empty datagram, which is all a client needs to learn the
///  host's address.
pub struct DefaultDiscoveryHandler;

impl ServerDiscoveryHandler for DefaultDiscoveryHandler {
    fn on_discover_host(&self, udp: &UdpChannel, from: SocketAddr) -> Result<bool> {
        udp.send_raw(&[], from)?;
        Ok(true)
    }
}
