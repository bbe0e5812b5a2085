//! Subscription Registry - Connection and Group Membership
//!
//! Single source of truth for which connection wants which updates.
//! Two sharded maps back it:
//! - `connections`: connection id -> sink plus the interests it holds
//! - `groups`: asset-class or symbol group -> member connection ids
//!
//! Lock order is always `connections` then `groups`. Lookups on the
//! broadcast path copy member ids out of `groups` before touching
//! `connections`, so they never hold both.
//!
//! Subscribing with an empty symbol list joins the asset-class group.
//! Subscribing with symbols joins only the per-symbol groups; an update
//! reaches the union of its asset-class group and its symbol group, so a
//! connection in both still receives it once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use uuid::Uuid;

use crate::domain::price::{AssetClass, CanonicalPriceUpdate};
use crate::ports::client_sink::ClientSink;

/// Opaque per-connection identifier.
pub type ConnectionId = Uuid;

/// Group a connection can be a member of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    AssetClass(AssetClass),
    Symbol(String),
}

/// One interest held by a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interest {
    /// Every update in the asset class.
    AssetClass(AssetClass),
    /// Updates for one symbol, recorded with the class it was requested under.
    Symbol { asset_class: AssetClass, symbol: String },
}

impl Interest {
    /// Group this interest maps to.
    pub fn group(&self) -> GroupKey {
        match self {
            Self::AssetClass(class) => GroupKey::AssetClass(*class),
            Self::Symbol { symbol, .. } => GroupKey::Symbol(symbol.clone()),
        }
    }

    fn symbol(&self) -> Option<&str> {
        match self {
            Self::AssetClass(_) => None,
            Self::Symbol { symbol, .. } => Some(symbol),
        }
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// Resolved fan-out target.
#[derive(Clone)]
pub struct Recipient {
    pub id: ConnectionId,
    pub sink: Arc<dyn ClientSink>,
}

impl std::fmt::Debug for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recipient").field("id", &self.id).finish_non_exhaustive()
    }
}

struct ConnectionEntry {
    sink: Arc<dyn ClientSink>,
    interests: HashSet<Interest>,
}

/// Build the interest set a subscribe/unsubscribe request refers to.
///
/// Symbols are trimmed and uppercased to match normalized updates; blanks
/// are ignored.
fn interests_for(asset_class: AssetClass, symbols: &[String]) -> Vec<Interest> {
    let mut seen = HashSet::new();
    let wanted: Vec<Interest> = symbols
        .iter()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .map(|symbol| Interest::Symbol { asset_class, symbol })
        .collect();

    if wanted.is_empty() {
        vec![Interest::AssetClass(asset_class)]
    } else {
        wanted
    }
}

/// Concurrent subscription registry.
#[derive(Default)]
pub struct SubscriptionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    groups: DashMap<GroupKey, HashSet<ConnectionId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection. Returns false if the id is
    /// already known, in which case the existing entry is left untouched.
    pub fn register(&self, id: ConnectionId, sink: Arc<dyn ClientSink>) -> bool {
        match self.connections.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry {
                    sink,
                    interests: HashSet::new(),
                });
                true
            }
        }
    }

    /// Add interests for a connection. Idempotent.
    ///
    /// Returns the symbols the request resolved to (empty for an
    /// asset-class subscription), for the acknowledgement.
    pub fn subscribe(
        &self,
        id: ConnectionId,
        asset_class: AssetClass,
        symbols: &[String],
    ) -> Result<Vec<String>, RegistryError> {
        let mut entry = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        let requested = interests_for(asset_class, symbols);
        for interest in &requested {
            if entry.interests.insert(interest.clone()) {
                self.groups.entry(interest.group()).or_default().insert(id);
            }
        }
        drop(entry);

        debug!(connection = %id, asset_class = %asset_class, count = requested.len(), "Subscribed");
        Ok(requested
            .iter()
            .filter_map(|i| i.symbol().map(str::to_string))
            .collect())
    }

    /// Remove interests for a connection.
    ///
    /// Removing something the connection never held, or unsubscribing an
    /// unknown connection, is a no-op. Returns the resolved symbols.
    pub fn unsubscribe(&self, id: ConnectionId, asset_class: AssetClass, symbols: &[String]) -> Vec<String> {
        let requested = interests_for(asset_class, symbols);

        if let Some(mut entry) = self.connections.get_mut(&id) {
            for interest in &requested {
                if !entry.interests.remove(interest) {
                    continue;
                }
                // The same symbol may still be held under another class.
                let group = interest.group();
                if !entry.interests.iter().any(|held| held.group() == group) {
                    self.leave_group(&group, id);
                }
            }
        }

        requested
            .iter()
            .filter_map(|i| i.symbol().map(str::to_string))
            .collect()
    }

    /// Drop a connection and every group membership it held.
    ///
    /// Returns the number of interests removed; unknown ids return 0.
    pub fn connection_closed(&self, id: ConnectionId) -> usize {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return 0;
        };

        for interest in &entry.interests {
            self.leave_group(&interest.group(), id);
        }

        debug!(connection = %id, removed = entry.interests.len(), "Connection removed from registry");
        entry.interests.len()
    }

    fn leave_group(&self, key: &GroupKey, id: ConnectionId) {
        if let Some(mut members) = self.groups.get_mut(key) {
            members.remove(&id);
        }
        self.groups.remove_if(key, |_, members| members.is_empty());
    }

    fn members(&self, key: &GroupKey) -> Vec<ConnectionId> {
        self.groups
            .get(key)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Connections that should receive `update`: the asset-class group
    /// plus the symbol group, each connection at most once.
    pub fn targets(&self, update: &CanonicalPriceUpdate) -> Vec<Recipient> {
        let mut ids = self.members(&GroupKey::AssetClass(update.asset_class));
        ids.extend(self.members(&GroupKey::Symbol(update.symbol.clone())));

        let mut seen = HashSet::with_capacity(ids.len());
        ids.into_iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| {
                self.connections.get(&id).map(|entry| Recipient {
                    id,
                    sink: Arc::clone(&entry.sink),
                })
            })
            .collect()
    }

    /// Targets for a batch, grouped per connection.
    ///
    /// Each recipient is paired with the indices of the updates it wants,
    /// in batch order. Recipients come back in first-seen order.
    pub fn batch_targets(&self, updates: &[CanonicalPriceUpdate]) -> Vec<(Recipient, Vec<usize>)> {
        let mut order: Vec<(Recipient, Vec<usize>)> = Vec::new();
        let mut slot_of: HashMap<ConnectionId, usize> = HashMap::new();

        for (index, update) in updates.iter().enumerate() {
            for recipient in self.targets(update) {
                match slot_of.get(&recipient.id) {
                    Some(&slot) => order[slot].1.push(index),
                    None => {
                        slot_of.insert(recipient.id, order.len());
                        order.push((recipient, vec![index]));
                    }
                }
            }
        }

        order
    }

    /// Interests held by a connection, sorted. `None` if unknown.
    pub fn interests(&self, id: ConnectionId) -> Option<Vec<Interest>> {
        self.connections.get(&id).map(|entry| {
            let mut held: Vec<Interest> = entry.interests.iter().cloned().collect();
            held.sort();
            held
        })
    }

    /// Member count of one group.
    pub fn group_size(&self, key: &GroupKey) -> usize {
        self.groups.get(key).map_or(0, |m| m.len())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Total interests across all connections.
    pub fn subscription_count(&self) -> usize {
        self.connections.iter().map(|e| e.interests.len()).sum()
    }
}
