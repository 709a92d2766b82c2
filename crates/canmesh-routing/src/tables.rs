//! Routing and neighbour tables.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RoutingError, RoutingResult};

/// Maximum number of routing entries.
pub const MAX_ROUTING_ENTRIES: usize = 16;

/// Maximum number of neighbour entries.
pub const MAX_NEIGHBOR_ENTRIES: usize = 8;

/// Maximum node identifier length in bytes.
pub const MAX_NODE_ID_LEN: usize = 32;

/// One routing table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination node identifier.
    pub dest: String,
    /// Next hop toward the destination.
    pub next_hop: String,
    /// Route cost.
    pub cost: u8,
    /// Milliseconds since layer start when the entry was last written.
    pub updated_at_ms: u64,
}

/// One neighbour table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    /// Neighbour node identifier.
    pub id: String,
    /// Received signal strength indicator.
    pub rssi: i8,
    /// Link quality, 0–255.
    pub link_quality: u8,
}

/// Ordered routing table without duplicate destinations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
}

impl RoutingTable {
    /// Insert a new entry.
    ///
    /// # Errors
    ///
    /// Rejects over-long identifiers, duplicate destinations and a full
    /// table.
    pub fn insert(&mut self, entry: RouteEntry) -> RoutingResult<()> {
        if entry.dest.len() > MAX_NODE_ID_LEN {
            return Err(RoutingError::IdTooLong(entry.dest));
        }
        if entry.next_hop.len() > MAX_NODE_ID_LEN {
            return Err(RoutingError::IdTooLong(entry.next_hop));
        }
        if self.find(&entry.dest).is_some() {
            return Err(RoutingError::DuplicateRoute(entry.dest));
        }
        if self.entries.len() >= MAX_ROUTING_ENTRIES {
            return Err(RoutingError::TableFull);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Overwrite the entry with the same destination.
    ///
    /// # Errors
    ///
    /// Fails when no entry exists for the destination.
    pub fn update(&mut self, entry: RouteEntry) -> RoutingResult<()> {
        match self.entries.iter_mut().find(|e| e.dest == entry.dest) {
            Some(slot) => {
                *slot = entry;
                Ok(())
            }
            None => Err(RoutingError::RouteMissing(entry.dest)),
        }
    }

    /// Remove the entry for a destination.
    ///
    /// # Errors
    ///
    /// Fails when no entry exists for the destination.
    pub fn remove(&mut self, dest: &str) -> RoutingResult<RouteEntry> {
        match self.entries.iter().position(|e| e.dest == dest) {
            Some(index) => Ok(self.entries.remove(index)),
            None => Err(RoutingError::RouteMissing(dest.to_string())),
        }
    }

    /// Entry for a destination, if any.
    pub fn find(&self, dest: &str) -> Option<&RouteEntry> {
        self.entries.iter().find(|e| e.dest == dest)
    }

    /// Entries whose destination contains `group` as a substring.
    pub fn group_members(&self, group: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.dest.contains(group))
            .count()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries beyond the table capacity.
    pub fn truncate_to_capacity(&mut self) {
        if self.entries.len() > MAX_ROUTING_ENTRIES {
            warn!(
                dropped = self.entries.len() - MAX_ROUTING_ENTRIES,
                "routing table truncated to capacity"
            );
            self.entries.truncate(MAX_ROUTING_ENTRIES);
        }
    }

    /// Append without duplicate checks, used by the recompute pass which
    /// starts from an empty table.
    pub(crate) fn push_unchecked(&mut self, entry: RouteEntry) {
        if self.entries.len() < MAX_ROUTING_ENTRIES {
            self.entries.push(entry);
        }
    }

    /// The entries, in order.
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bounded neighbour table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborTable {
    entries: Vec<NeighborEntry>,
}

impl NeighborTable {
    /// Build a table from at most [`MAX_NEIGHBOR_ENTRIES`] neighbours.
    pub fn from_entries(entries: impl IntoIterator<Item = NeighborEntry>) -> Self {
        let mut table = Self::default();
        for entry in entries {
            if table.entries.len() >= MAX_NEIGHBOR_ENTRIES {
                warn!("neighbour table full, dropping remaining entries");
                break;
            }
            table.entries.push(entry);
        }
        table
    }

    /// The entries, in order.
    pub fn entries(&self) -> &[NeighborEntry] {
        &self.entries
    }

    /// Number of neighbours.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no neighbours.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dest: &str) -> RouteEntry {
        RouteEntry {
            dest: dest.to_string(),
            next_hop: dest.to_string(),
            cost: 1,
            updated_at_ms: 1,
        }
    }

    #[test]
    fn duplicate_destination_is_rejected() {
        let mut table = RoutingTable::default();
        table.insert(route("motor_control_ecu")).unwrap();
        let err = table.insert(route("motor_control_ecu")).unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateRoute(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn insert_then_remove_restores_the_table() {
        let mut table = RoutingTable::default();
        table.insert(route("brake_control_ecu")).unwrap();
        let before = table.clone();

        table.insert(route("steering_control_ecu")).unwrap();
        table.remove("steering_control_ecu").unwrap();
        assert_eq!(table, before);
    }

    #[test]
    fn update_requires_an_existing_entry() {
        let mut table = RoutingTable::default();
        let err = table.update(route("nobody")).unwrap_err();
        assert!(matches!(err, RoutingError::RouteMissing(_)));

        table.insert(route("motor_control_ecu")).unwrap();
        let mut changed = route("motor_control_ecu");
        changed.cost = 9;
        table.update(changed).unwrap();
        assert_eq!(table.find("motor_control_ecu").unwrap().cost, 9);
    }

    #[test]
    fn table_capacity_is_enforced() {
        let mut table = RoutingTable::default();
        for i in 0..MAX_ROUTING_ENTRIES {
            table.insert(route(&format!("ecu_{i}"))).unwrap();
        }
        let err = table.insert(route("one_too_many")).unwrap_err();
        assert!(matches!(err, RoutingError::TableFull));
    }

    #[test]
    fn over_long_ids_are_rejected() {
        let mut table = RoutingTable::default();
        let err = table.insert(route(&"x".repeat(33))).unwrap_err();
        assert!(matches!(err, RoutingError::IdTooLong(_)));
    }

    #[test]
    fn group_members_match_by_substring() {
        let mut table = RoutingTable::default();
        table.insert(route("motor_control_ecu")).unwrap();
        table.insert(route("brake_control_ecu")).unwrap();
        table.insert(route("monitor_ecu")).unwrap();

        assert_eq!(table.group_members("control"), 2);
        assert_eq!(table.group_members("ecu"), 3);
        assert_eq!(table.group_members("body"), 0);
    }

    #[test]
    fn neighbour_table_caps_at_eight() {
        let table = NeighborTable::from_entries((0..12).map(|i| NeighborEntry {
            id: format!("n{i}"),
            rssi: -40,
            link_quality: 200,
        }));
        assert_eq!(table.len(), MAX_NEIGHBOR_ENTRIES);
    }
}
