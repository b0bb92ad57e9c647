//! The unit of data flowing through the graph.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::error::{GraphError, GraphResult};
use crate::timestamp::Timestamp;

/// An immutable, type-erased value stamped with a [`Timestamp`].
///
/// The payload is shared: cloning a packet or rebinding its timestamp with
/// [`Packet::at`] never copies the value, so a packet can sit in several
/// downstream queues and observer callbacks at once. A packet may also be
/// empty, in which case only its timestamp carries information (streams use
/// empty packets to signal timestamp-bound updates to observers).
#[derive(Clone)]
pub struct Packet {
    payload: Option<Arc<dyn Any + Send + Sync>>,
    type_name: &'static str,
    timestamp: Timestamp,
}

impl Packet {
    /// Wraps `value` into a packet with an unset timestamp.
    pub fn new<T: Any + Send + Sync>(value: T) -> Packet {
        Packet {
            payload: Some(Arc::new(value)),
            type_name: std::any::type_name::<T>(),
            timestamp: Timestamp::UNSET,
        }
    }

    /// A packet with no payload and an unset timestamp.
    pub fn empty() -> Packet {
        Packet {
            payload: None,
            type_name: "",
            timestamp: Timestamp::UNSET,
        }
    }

    /// Returns a new packet sharing the payload, bound to `timestamp`.
    pub fn at(&self, timestamp: Timestamp) -> Packet {
        Packet {
            payload: self.payload.clone(),
            type_name: self.type_name,
            timestamp,
        }
    }

    /// Borrows the payload, failing if the packet is empty or holds a
    /// different type.
    pub fn get<T: Any>(&self) -> GraphResult<&T> {
        let payload = self.payload.as_ref().ok_or_else(|| {
            GraphError::InvalidArgument(format!(
                "cannot read a {} out of an empty packet",
                std::any::type_name::<T>()
            ))
        })?;
        payload.downcast_ref::<T>().ok_or_else(|| {
            GraphError::InvalidArgument(format!(
                "packet holds a {} but a {} was requested",
                self.type_name,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The fully qualified name of the payload type, empty for empty packets.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn payload_type_id(&self) -> Option<TypeId> {
        self.payload.as_ref().map(|p| p.as_ref().type_id())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "Packet(empty @ {})", self.timestamp)
        } else {
            write!(f, "Packet({} @ {})", self.type_name, self.timestamp)
        }
    }
}
