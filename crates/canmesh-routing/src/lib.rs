//! Routing layer of the canmesh monitor node.
//!
//! Maintains the routing and neighbour tables, recomputes routes on mesh
//! topology events, and dispatches unicast/multicast/broadcast messages
//! with fallback retries on route misses. Three workers drive it: an event
//! task consuming mesh events, a send task draining the send queue, and a
//! receive task handing incoming messages to subscribers.

pub mod error;
pub mod events;
pub mod layer;
pub mod tables;

pub use error::{RoutingError, RoutingResult};
pub use events::{MeshEvent, ReceivedMessage, RoutingEvent, SendMode};
pub use layer::{RoutingLayer, SubscriberId};
pub use tables::{
    NeighborEntry, NeighborTable, RouteEntry, RoutingTable, MAX_NEIGHBOR_ENTRIES,
    MAX_NODE_ID_LEN, MAX_ROUTING_ENTRIES,
};
