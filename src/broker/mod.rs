//! Event-broker side of the harness
//!
//! Event records and match criteria, the codec seam, and the links step
//! handlers use to talk to the broker under test.

pub mod codec;
pub mod link;
pub mod types;

pub use codec::{is_event_type, EventCodec, EventDecoder, TextEventCodec, EVENT_TYPES};
pub use link::{Endpoint, Link, LinkEvent, LinkNotifier, LinkSpec, PeerMessage, Role, Route};
pub use types::{EventRecord, MatchCriteria};
