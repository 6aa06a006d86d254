//! Carrier override resolution.
//!
//! Maps each (slot, feature) to the carrier-preferred package name, sourced
//! from per-subscription configuration. Absence of configuration is a valid,
//! stable state: affected keys simply fall back to the device default, so no
//! retry machinery lives here.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::feature::{Feature, SlotFeatureKey, SlotIndex};

/// Typed view of the per-subscription carrier configuration bundle.
///
/// The unified key applies to every independent feature; a per-feature key,
/// when present, wins over the unified key for that feature. Empty-string
/// package names are treated as absent. Unknown bundle keys are ignored,
/// including any key naming a dependent feature: emergency voice always
/// follows the voice holder, so it is not overridable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierConfig {
	/// Package overriding every independent feature unless a per-feature key
	/// wins.
	#[serde(default)]
	pub override_package: Option<String>,
	/// Package overriding the voice feature.
	#[serde(default)]
	pub voice_override_package: Option<String>,
	/// Package overriding the messaging feature.
	#[serde(default)]
	pub messaging_override_package: Option<String>,
}

impl CarrierConfig {
	/// The override package for `feature`, if configured.
	///
	/// Dependent features have no override: they ride with their dependency's
	/// holder, so this is always `None` for them.
	pub fn override_for(&self, feature: Feature) -> Option<&str> {
		let specific = match feature {
			Feature::Voice => &self.voice_override_package,
			Feature::Messaging => &self.messaging_override_package,
			Feature::EmergencyVoice => return None,
		};
		non_empty(specific).or_else(|| non_empty(&self.override_package))
	}
}

fn non_empty(value: &Option<String>) -> Option<&str> {
	value.as_deref().filter(|s| !s.is_empty())
}

/// Source of per-subscription carrier configuration bundles.
#[async_trait]
pub trait CarrierConfigSource: Send + Sync {
	/// The raw key/value bundle for the subscription active on `slot`, or
	/// `None` when configuration is not available yet (no SIM, or pre-unlock
	/// at boot). Absent configuration is stable and valid.
	async fn config_for_slot(&self, slot: SlotIndex) -> Option<serde_json::Value>;
}

/// Per-slot override table computed from carrier configuration.
///
/// A recompute replaces a slot's entry wholesale; the map is never partially
/// stale for a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarrierOverrideMap {
	slots: BTreeMap<SlotIndex, BTreeMap<Feature, String>>,
}

impl CarrierOverrideMap {
	/// The carrier-desired package for `key`, if any.
	pub fn override_for(&self, key: SlotFeatureKey) -> Option<&str> {
		self.slots
			.get(&key.slot)?
			.get(&key.feature)
			.map(String::as_str)
	}

	/// Whether no slot carries any override.
	pub fn is_empty(&self) -> bool {
		self.slots.values().all(BTreeMap::is_empty)
	}

	// Slots without overrides are not stored, so an all-absent configuration
	// compares equal to the default map.
	fn set_slot(&mut self, slot: SlotIndex, overrides: BTreeMap<Feature, String>) {
		if overrides.is_empty() {
			self.slots.remove(&slot);
		} else {
			self.slots.insert(slot, overrides);
		}
	}
}

/// Recomputes the [`CarrierOverrideMap`] from the configuration source.
///
/// Owned and driven by the resolver loop on configuration-changed events,
/// slot-topology changes, and boot completion.
pub struct OverrideResolver {
	source: Arc<dyn CarrierConfigSource>,
	map: CarrierOverrideMap,
}

impl OverrideResolver {
	/// Create a resolver with an empty override map.
	pub fn new(source: Arc<dyn CarrierConfigSource>) -> Self {
		Self {
			source,
			map: CarrierOverrideMap::default(),
		}
	}

	/// The current override map.
	pub fn map(&self) -> &CarrierOverrideMap {
		&self.map
	}

	/// Recompute overrides for every active slot, dropping slots beyond
	/// `slot_count`. Returns whether the map changed.
	pub async fn recompute_all(&mut self, slot_count: u8) -> bool {
		let mut map = CarrierOverrideMap::default();
		for slot in (0..slot_count).map(SlotIndex) {
			map.set_slot(slot, self.slot_overrides(slot).await);
		}
		let changed = map != self.map;
		if changed {
			debug!(slot_count, "carrier override map recomputed");
			self.map = map;
		}
		changed
	}

	/// Recompute overrides for one slot, replacing its entry wholesale.
	/// Returns whether the map changed.
	pub async fn recompute_slot(&mut self, slot: SlotIndex) -> bool {
		let overrides = self.slot_overrides(slot).await;
		let changed = self
			.map
			.slots
			.get(&slot)
			.map_or(!overrides.is_empty(), |old| old != &overrides);
		if changed {
			debug!(%slot, ?overrides, "carrier overrides changed for slot");
			self.map.set_slot(slot, overrides);
		}
		changed
	}

	async fn slot_overrides(&self, slot: SlotIndex) -> BTreeMap<Feature, String> {
		let Some(bundle) = self.source.config_for_slot(slot).await else {
			return BTreeMap::new();
		};
		let config: CarrierConfig = match serde_json::from_value(bundle) {
			Ok(config) => config,
			Err(err) => {
				warn!(%slot, error = %err, "malformed carrier configuration; treating as absent");
				return BTreeMap::new();
			}
		};
		Feature::ALL
			.into_iter()
			.filter_map(|feature| {
				config
					.override_for(feature)
					.map(|package| (feature, package.to_owned()))
			})
			.collect()
	}
}

#[cfg(test)]
mod tests;
