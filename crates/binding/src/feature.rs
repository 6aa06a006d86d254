//! Feature identity and slot/feature keying.
//!
//! Features form a small closed set with an explicit dependency table rather
//! than a hierarchy: emergency voice may only be active on a (package, slot)
//! where plain voice is also active.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One telephony capability a service implementation may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
	/// Voice calling.
	Voice,
	/// Messaging.
	Messaging,
	/// Emergency voice calling. Depends on [`Feature::Voice`].
	EmergencyVoice,
}

impl Feature {
	/// Every feature, in creation order (dependencies sort before their
	/// dependents, so iterating a sorted key set creates prerequisites first).
	pub const ALL: [Feature; 3] = [Feature::Voice, Feature::Messaging, Feature::EmergencyVoice];

	/// The feature this one may only be active alongside, on the same
	/// (package, slot), if any.
	pub fn depends_on(self) -> Option<Feature> {
		match self {
			Feature::EmergencyVoice => Some(Feature::Voice),
			Feature::Voice | Feature::Messaging => None,
		}
	}

	/// Features that are assigned independently (no dependency on another
	/// feature). Dependent features ride with their dependency's holder.
	pub fn independent() -> impl Iterator<Item = Feature> {
		Self::ALL.into_iter().filter(|f| f.depends_on().is_none())
	}
}

impl fmt::Display for Feature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Feature::Voice => "voice",
			Feature::Messaging => "messaging",
			Feature::EmergencyVoice => "emergency-voice",
		};
		f.write_str(name)
	}
}

/// A physical or logical SIM slot position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub u8);

impl fmt::Display for SlotIndex {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// The unit of assignment: one feature on one slot.
///
/// At any stable point, at most one package is assigned a given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotFeatureKey {
	/// Slot index.
	pub slot: SlotIndex,
	/// Feature provided on that slot.
	pub feature: Feature,
}

impl SlotFeatureKey {
	/// Create a key from a raw slot index and feature.
	pub fn new(slot: u8, feature: Feature) -> Self {
		Self {
			slot: SlotIndex(slot),
			feature,
		}
	}

	/// The key this one depends on, if its feature has a dependency.
	pub fn dependency(self) -> Option<SlotFeatureKey> {
		self.feature.depends_on().map(|feature| SlotFeatureKey {
			slot: self.slot,
			feature,
		})
	}
}

impl fmt::Display for SlotFeatureKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "({}, {})", self.slot, self.feature)
	}
}
