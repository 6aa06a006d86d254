use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::json;

use super::*;

struct MockConfigSource {
	bundles: Mutex<HashMap<SlotIndex, serde_json::Value>>,
}

impl MockConfigSource {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			bundles: Mutex::new(HashMap::new()),
		})
	}

	fn set(&self, slot: u8, bundle: serde_json::Value) {
		self.bundles.lock().insert(SlotIndex(slot), bundle);
	}

	fn clear(&self, slot: u8) {
		self.bundles.lock().remove(&SlotIndex(slot));
	}
}

#[async_trait]
impl CarrierConfigSource for MockConfigSource {
	async fn config_for_slot(&self, slot: SlotIndex) -> Option<serde_json::Value> {
		self.bundles.lock().get(&slot).cloned()
	}
}

#[test]
fn per_feature_key_wins_over_unified() {
	let config = CarrierConfig {
		override_package: Some("com.carrier.all".into()),
		messaging_override_package: Some("com.carrier.msg".into()),
		..Default::default()
	};
	assert_eq!(config.override_for(Feature::Voice), Some("com.carrier.all"));
	assert_eq!(config.override_for(Feature::Messaging), Some("com.carrier.msg"));
}

#[test]
fn empty_string_package_is_absent() {
	let config = CarrierConfig {
		override_package: Some(String::new()),
		voice_override_package: Some("com.carrier.voice".into()),
		..Default::default()
	};
	assert_eq!(config.override_for(Feature::Voice), Some("com.carrier.voice"));
	assert_eq!(config.override_for(Feature::Messaging), None);
}

#[test]
fn dependent_features_are_not_overridable() {
	let config = CarrierConfig {
		override_package: Some("com.carrier.all".into()),
		..Default::default()
	};
	// Emergency voice rides with the voice holder, never with an override.
	assert_eq!(config.override_for(Feature::EmergencyVoice), None);
}

#[tokio::test]
async fn emergency_override_key_in_bundle_is_ignored() {
	let source = MockConfigSource::new();
	source.set(
		0,
		json!({
			"override_package": "com.carrier.a",
			"emergency_voice_override_package": "com.carrier.e",
		}),
	);

	let mut resolver = OverrideResolver::new(source);
	resolver.recompute_all(1).await;

	let map = resolver.map();
	assert_eq!(
		map.override_for(SlotFeatureKey::new(0, Feature::Voice)),
		Some("com.carrier.a")
	);
	assert_eq!(
		map.override_for(SlotFeatureKey::new(0, Feature::EmergencyVoice)),
		None
	);
}

#[tokio::test]
async fn absent_configuration_yields_no_overrides() {
	let source = MockConfigSource::new();
	let mut resolver = OverrideResolver::new(source);
	assert!(!resolver.recompute_all(2).await);
	assert!(resolver.map().is_empty());
}

#[tokio::test]
async fn recompute_all_builds_per_slot_entries() {
	let source = MockConfigSource::new();
	source.set(0, json!({ "override_package": "com.carrier.a" }));
	source.set(1, json!({ "messaging_override_package": "com.carrier.b" }));

	let mut resolver = OverrideResolver::new(source);
	assert!(resolver.recompute_all(2).await);

	let map = resolver.map();
	assert_eq!(
		map.override_for(SlotFeatureKey::new(0, Feature::Voice)),
		Some("com.carrier.a")
	);
	assert_eq!(
		map.override_for(SlotFeatureKey::new(0, Feature::Messaging)),
		Some("com.carrier.a")
	);
	assert_eq!(
		map.override_for(SlotFeatureKey::new(1, Feature::Voice)),
		None
	);
	assert_eq!(
		map.override_for(SlotFeatureKey::new(1, Feature::Messaging)),
		Some("com.carrier.b")
	);
}

#[tokio::test]
async fn recompute_slot_replaces_entry_wholesale() {
	let source = MockConfigSource::new();
	source.set(0, json!({ "override_package": "com.carrier.a" }));

	let mut resolver = OverrideResolver::new(source.clone());
	resolver.recompute_all(1).await;

	// New bundle names only voice; the old unified override must not linger
	// for other features.
	source.set(0, json!({ "voice_override_package": "com.carrier.v" }));
	assert!(resolver.recompute_slot(SlotIndex(0)).await);

	let map = resolver.map();
	assert_eq!(
		map.override_for(SlotFeatureKey::new(0, Feature::Voice)),
		Some("com.carrier.v")
	);
	assert_eq!(
		map.override_for(SlotFeatureKey::new(0, Feature::Messaging)),
		None
	);

	// Unchanged bundle reports no change.
	assert!(!resolver.recompute_slot(SlotIndex(0)).await);
}

#[tokio::test]
async fn configuration_withdrawal_clears_slot() {
	let source = MockConfigSource::new();
	source.set(0, json!({ "override_package": "com.carrier.a" }));

	let mut resolver = OverrideResolver::new(source.clone());
	resolver.recompute_all(1).await;

	source.clear(0);
	assert!(resolver.recompute_slot(SlotIndex(0)).await);
	assert!(resolver.map().is_empty());
}

#[tokio::test]
async fn malformed_bundle_is_treated_as_absent() {
	let source = MockConfigSource::new();
	source.set(0, json!({ "override_package": 17 }));

	let mut resolver = OverrideResolver::new(source);
	assert!(!resolver.recompute_all(1).await);
	assert!(resolver.map().is_empty());
}

#[tokio::test]
async fn slot_count_shrink_drops_stale_slots() {
	let source = MockConfigSource::new();
	source.set(0, json!({ "override_package": "com.carrier.a" }));
	source.set(1, json!({ "override_package": "com.carrier.b" }));

	let mut resolver = OverrideResolver::new(source);
	resolver.recompute_all(2).await;
	assert!(resolver.recompute_all(1).await);
	assert_eq!(
		resolver.map().override_for(SlotFeatureKey::new(1, Feature::Voice)),
		None
	);
}
