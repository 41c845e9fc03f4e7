/// Internal control messages. They travel in-band as ordinary serialized
///  objects, so every [Serialization](crate::Serialization) implementation
///  must be able to encode and decode them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameworkMessage {
    /// server -> client over TCP, immediately after accept: the server-assigned
    ///  connection id
    RegisterTcp { connection_id: i32 },

    /// client -> server over UDP to bind the datagram source address to the
    ///  TCP connection; echoed server -> client over TCP as acknowledgement
    RegisterUdp { connection_id: i32 },

    /// periodic TCP filler while a connection is otherwise idle
    KeepAlive,

    /// latency probe; the receiver of a non-reply flips `is_reply` and sends
    ///  it back over TCP
    Ping { id: i32, is_reply: bool },

    /// broadcast UDP discovery; the response is defined by the
    ///  [ServerDiscoveryHandler](crate::ServerDiscoveryHandler)
    DiscoverHost,
}
