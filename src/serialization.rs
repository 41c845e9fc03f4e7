use std::any::Any;

#[cfg(test)]
use mockall::automock;

use crate::buffers::FixedBuf;
use crate::connection::Connection;
use crate::error::Result;

/// Objects are dynamically typed on the wire: the core moves them around as
///  boxed [Any] values and only ever inspects them for
///  [FrameworkMessage](crate::FrameworkMessage)s.
pub type ObjectBox = Box<dyn Any + Send>;

/// The pluggable object encoding. Given a buffer, an implementation encodes or
///  decodes exactly one object; the core takes care of framing, so neither
///  side sees length prefixes or datagram boundaries.
///
/// The optional connection supplies codec context (a per-connection type
///  registry, say) but must not change the wire format.
///
/// Implementations must encode [FrameworkMessage](crate::FrameworkMessage)
///  values: the control handshake travels through the same codec as
///  application objects.
#[cfg_attr(test, automock)]
pub trait Serialization: Send + Sync + 'static {
    /// Encode one object into `target`, which is cleared beforehand by the
    ///  caller and has the configured object buffer size as its capacity. An
    ///  object that does not fit must be rejected, not truncated.
    fn write_object<'a>(&self, connection: Option<&'a Connection>, target: &mut FixedBuf, object: &dyn Any) -> Result<()>;

    /// Decode one object from `source`, which holds exactly one serialized
    ///  object (one TCP frame payload or one datagram), advancing the slice
    ///  past the bytes that were used. The caller rejects a decode that
    ///  leaves bytes behind, so implementations must consume the buffer
    ///  exactly.
    fn read_object<'a, 'b>(&self, connection: Option<&'a Connection>, source: &mut &'b [u8]) -> Result<ObjectBox>;
}
