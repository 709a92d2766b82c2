//! Mesh events consumed by the layer and routing events emitted to
//! subscribers.

use std::sync::Arc;

use crate::tables::{NeighborTable, RoutingTable};

/// Topology events delivered by the mesh radio.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// The neighbour set changed; carries the new neighbour table.
    NeighborChange(NeighborTable),
    /// This node (re)connected to its parent.
    ParentConnected,
    /// The mesh elected a different root.
    RootSwitched,
    /// Any other radio event; ignored with a warning.
    Unknown(u8),
}

/// Events emitted to routing subscribers.
#[derive(Debug, Clone)]
pub enum RoutingEvent {
    /// The routing table changed; carries a snapshot.
    TableUpdated(RoutingTable),
    /// The neighbour table changed; carries a snapshot.
    NeighborTableUpdated(NeighborTable),
    /// A message could not be routed to the named destination or group.
    RouteFailure(String),
    /// A message arrived; subscribers share ownership of it.
    MessageReceived(Arc<ReceivedMessage>),
}

/// Message delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Deliver to a single destination via its next hop.
    Unicast,
    /// Deliver to every destination whose id contains the group id.
    Multicast,
    /// Deliver to every neighbour.
    Broadcast,
}

/// A message taken off the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Source node identifier.
    pub src: String,
    /// Payload bytes.
    pub data: Vec<u8>,
}

/// A message queued for the send task.
#[derive(Debug, Clone)]
pub(crate) struct SendRequest {
    pub(crate) dest: String,
    pub(crate) data: Vec<u8>,
    pub(crate) mode: SendMode,
}
