//! Process-wide store of live remote feature handles.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::warn;

use crate::feature::SlotFeatureKey;
use crate::transport::{ConnectionId, FeatureHandle};

/// Keyed store `SlotFeatureKey → FeatureHandle`, written by service
/// controllers on feature creation/removal and read by external feature
/// consumers.
///
/// An entry exists exactly while the corresponding feature is live. The
/// repository is the one piece of state shared across controller instances;
/// it is passed by explicit `Arc` into every component that needs it, never
/// accessed as an implicit singleton. Only the controller that owns a key
/// mutates it; reads are plain keyed lookups.
#[derive(Debug, Default)]
pub struct FeatureRepository {
	entries: RwLock<HashMap<SlotFeatureKey, FeatureHandle>>,
}

impl FeatureRepository {
	/// Create an empty repository.
	pub fn new() -> Self {
		Self::default()
	}

	/// Publish the handle for a freshly created feature.
	///
	/// A key is owned by at most one controller at a time, so an existing
	/// entry indicates a bookkeeping bug upstream; the new handle wins.
	pub fn publish(&self, key: SlotFeatureKey, handle: FeatureHandle) {
		if let Some(old) = self.entries.write().insert(key, handle) {
			warn!(%key, old_connection = %old.connection, "replacing live feature handle");
		}
	}

	/// Withdraw the handle for a torn-down feature, but only while
	/// `connection` still owns the entry.
	///
	/// When a key moves between two connected controllers, the gaining
	/// controller may publish its handle before the losing one tears the key
	/// down; the superseded owner's withdrawal must not delete the live
	/// entry.
	pub fn withdraw(&self, key: SlotFeatureKey, connection: ConnectionId) -> Option<FeatureHandle> {
		let mut entries = self.entries.write();
		match entries.get(&key) {
			Some(handle) if handle.connection == connection => entries.remove(&key),
			_ => None,
		}
	}

	/// Look up the live handle for a key, if any.
	pub fn get(&self, key: SlotFeatureKey) -> Option<FeatureHandle> {
		self.entries.read().get(&key).cloned()
	}

	/// Whether a live handle exists for a key.
	pub fn contains(&self, key: SlotFeatureKey) -> bool {
		self.entries.read().contains_key(&key)
	}

	/// Number of live features.
	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	/// Whether no features are live.
	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}
}
