//! Active connection set.
//!
//! The orchestrator owns every connection exclusively; a unit never
//! outlives its registry entry. Deactivation closes the channel and keeps
//! the entry around so reports can still name the unit.

use tactus_transport::Channel;

/// Whether a unit still participates in rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    /// Participating in the fan-out.
    Active,
    /// Removed from the fan-out after an unrecoverable failure.
    Inactive {
        /// Why the unit was removed.
        reason: String,
    },
}

/// One attached unit and its channel.
pub struct UnitConnection {
    /// The unit's configured id.
    pub unit_id: u32,
    /// The channel to the unit.
    pub channel: Channel,
    /// Participation status.
    pub status: UnitStatus,
}

impl UnitConnection {
    /// Create an active connection.
    pub fn new(unit_id: u32, channel: Channel) -> Self {
        Self { unit_id, channel, status: UnitStatus::Active }
    }

    /// Whether the unit participates in the next fan-out.
    pub fn is_active(&self) -> bool {
        self.status == UnitStatus::Active
    }
}

/// The orchestrator's connection set, in attach order.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Vec<UnitConnection>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub fn insert(&mut self, connection: UnitConnection) {
        self.entries.push(connection);
    }

    /// Total number of entries, inactive included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of units participating in the next fan-out.
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_active()).count()
    }

    /// Iterate over active connections mutably.
    pub fn active_mut(&mut self) -> impl Iterator<Item = &mut UnitConnection> {
        self.entries.iter_mut().filter(|entry| entry.is_active())
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &UnitConnection> {
        self.entries.iter()
    }

    /// Look up a unit.
    pub fn get(&self, unit_id: u32) -> Option<&UnitConnection> {
        self.entries.iter().find(|entry| entry.unit_id == unit_id)
    }

    /// Remove a unit from the fan-out and close its channel.
    pub fn deactivate(&mut self, unit_id: u32, reason: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.unit_id == unit_id) {
            if entry.is_active() {
                tracing::warn!(unit_id, reason, "deactivating unit");
                entry.channel.close();
                entry.status = UnitStatus::Inactive { reason: reason.to_owned() };
            }
        }
    }

    /// Close every channel.
    pub fn close_all(&mut self) {
        for entry in &mut self.entries {
            entry.channel.close();
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("units", &self.entries.len())
            .field("active", &self.active_count())
            .finish()
    }
}
