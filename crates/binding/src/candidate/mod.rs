//! Candidate registry.
//!
//! Discovers and caches installed packages that advertise the feature-service
//! interface, exposing static feature sets for trusted candidates and
//! "unknown — must query" for the rest.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Result;
use crate::feature::Feature;

/// One component row returned by the external package directory.
///
/// The directory only returns components that advertise the service interface
/// and hold the required permission; malformed or permission-lacking
/// components are silently excluded before they reach this subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
	/// Package name of the component.
	pub package: String,
	/// Whether the package is a carrier-supplied candidate.
	#[serde(default)]
	pub is_carrier_candidate: bool,
	/// Feature flags declared in the package manifest.
	#[serde(default)]
	pub declared_features: BTreeSet<Feature>,
	/// Whether the package asks to be probed instead of trusting its
	/// manifest declaration.
	#[serde(default)]
	pub requires_query: bool,
}

/// Query interface to the external package/component directory.
#[async_trait]
pub trait DirectoryQuery: Send + Sync {
	/// Enumerate all components advertising the service interface.
	async fn query_candidates(&self) -> Result<Vec<DirectoryEntry>>;

	/// Query a single package. `None` when the package no longer advertises
	/// the service interface (uninstalled, disabled, or permission lost).
	async fn query_package(&self, package: &str) -> Result<Option<DirectoryEntry>>;
}

/// Cached view of one candidate package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
	/// Package name.
	pub package: String,
	/// Whether the package is a carrier-supplied candidate.
	pub is_carrier_candidate: bool,
	/// Manifest-declared features. Only populated for candidates whose
	/// declaration is trusted; empty when a dynamic query is required.
	pub static_features: BTreeSet<Feature>,
	/// Whether the effective feature set must come from a dynamic query.
	/// Always true for carrier candidates: a carrier package may not
	/// self-certify features it does not implement.
	pub requires_dynamic_query: bool,
}

impl ServiceInfo {
	fn from_entry(entry: DirectoryEntry) -> Self {
		let requires_dynamic_query = entry.is_carrier_candidate || entry.requires_query;
		Self {
			package: entry.package,
			is_carrier_candidate: entry.is_carrier_candidate,
			// Manifest declarations are trusted only when no query is required.
			static_features: if requires_dynamic_query {
				BTreeSet::new()
			} else {
				entry.declared_features
			},
			requires_dynamic_query,
		}
	}
}

/// Cache of installed candidate packages, keyed by package name.
///
/// Owned and mutated by the resolver loop; every mutating operation reports
/// whether the cached set changed so the caller knows to recompute the global
/// assignment.
pub struct CandidateRegistry {
	directory: Arc<dyn DirectoryQuery>,
	candidates: BTreeMap<String, ServiceInfo>,
}

impl CandidateRegistry {
	/// Create an empty registry backed by `directory`.
	pub fn new(directory: Arc<dyn DirectoryQuery>) -> Self {
		Self {
			directory,
			candidates: BTreeMap::new(),
		}
	}

	/// Re-query the directory for all candidates, replacing the cached set.
	///
	/// Returns whether the cache changed.
	///
	/// # Errors
	///
	/// [`crate::Error::CandidateQuery`] when the directory is unreachable;
	/// the cache is left untouched and the caller retries on the next
	/// refresh.
	pub async fn refresh(&mut self) -> Result<bool> {
		let entries = self.directory.query_candidates().await?;
		let fresh: BTreeMap<String, ServiceInfo> = entries
			.into_iter()
			.map(|entry| {
				let info = ServiceInfo::from_entry(entry);
				(info.package.clone(), info)
			})
			.collect();
		let changed = fresh != self.candidates;
		if changed {
			info!(count = fresh.len(), "candidate set refreshed");
			self.candidates = fresh;
		}
		Ok(changed)
	}

	/// Re-query a single package after a package-changed notification.
	///
	/// Returns whether the cache changed.
	pub async fn on_package_changed(&mut self, package: &str) -> Result<bool> {
		match self.directory.query_package(package).await? {
			Some(entry) => {
				let info = ServiceInfo::from_entry(entry);
				let changed = self.candidates.get(package) != Some(&info);
				if changed {
					debug!(package = %package, "candidate updated");
					self.candidates.insert(info.package.clone(), info);
				}
				Ok(changed)
			}
			None => Ok(self.on_package_removed(package)),
		}
	}

	/// Evict a removed package. Returns whether it was present.
	pub fn on_package_removed(&mut self, package: &str) -> bool {
		let evicted = self.candidates.remove(package).is_some();
		if evicted {
			debug!(package = %package, "candidate evicted");
		}
		evicted
	}

	/// Look up a candidate by package name.
	pub fn get(&self, package: &str) -> Option<&ServiceInfo> {
		self.candidates.get(package)
	}

	/// All cached candidates, in package-name order.
	pub fn iter(&self) -> impl Iterator<Item = &ServiceInfo> {
		self.candidates.values()
	}

	/// Device-default candidates able to provide `feature` statically, in
	/// package-name order. The first acceptable one is the fallback provider
	/// for any (slot, `feature`) not claimed by a confirmed carrier override.
	pub fn device_defaults_for(&self, feature: Feature) -> impl Iterator<Item = &ServiceInfo> {
		self.candidates
			.values()
			.filter(move |info| !info.is_carrier_candidate && info.static_features.contains(&feature))
	}

	/// Number of cached candidates.
	pub fn len(&self) -> usize {
		self.candidates.len()
	}

	/// Whether the cache is empty.
	pub fn is_empty(&self) -> bool {
		self.candidates.is_empty()
	}
}

#[cfg(test)]
mod tests;
