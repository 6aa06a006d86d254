use parking_lot::Mutex;

use super::*;
use crate::Error;

/// Directory mock with a settable candidate table and a failure switch.
struct MockDirectory {
	entries: Mutex<Vec<DirectoryEntry>>,
	fail: Mutex<bool>,
}

impl MockDirectory {
	fn new(entries: Vec<DirectoryEntry>) -> Arc<Self> {
		Arc::new(Self {
			entries: Mutex::new(entries),
			fail: Mutex::new(false),
		})
	}

	fn set_entries(&self, entries: Vec<DirectoryEntry>) {
		*self.entries.lock() = entries;
	}

	fn set_fail(&self, fail: bool) {
		*self.fail.lock() = fail;
	}
}

#[async_trait]
impl DirectoryQuery for MockDirectory {
	async fn query_candidates(&self) -> Result<Vec<DirectoryEntry>> {
		if *self.fail.lock() {
			return Err(Error::CandidateQuery("directory offline".into()));
		}
		Ok(self.entries.lock().clone())
	}

	async fn query_package(&self, package: &str) -> Result<Option<DirectoryEntry>> {
		if *self.fail.lock() {
			return Err(Error::CandidateQuery("directory offline".into()));
		}
		Ok(self.entries.lock().iter().find(|e| e.package == package).cloned())
	}
}

fn device_entry(package: &str, features: &[Feature]) -> DirectoryEntry {
	DirectoryEntry {
		package: package.into(),
		is_carrier_candidate: false,
		declared_features: features.iter().copied().collect(),
		requires_query: false,
	}
}

fn carrier_entry(package: &str, declared: &[Feature]) -> DirectoryEntry {
	DirectoryEntry {
		package: package.into(),
		is_carrier_candidate: true,
		declared_features: declared.iter().copied().collect(),
		requires_query: false,
	}
}

#[tokio::test]
async fn refresh_replaces_cache() {
	let directory = MockDirectory::new(vec![device_entry("com.device.tel", &[Feature::Voice])]);
	let mut registry = CandidateRegistry::new(directory.clone());

	assert!(registry.refresh().await.unwrap());
	assert_eq!(registry.len(), 1);

	// Unchanged directory reports no change.
	assert!(!registry.refresh().await.unwrap());

	directory.set_entries(vec![
		device_entry("com.device.tel", &[Feature::Voice]),
		device_entry("com.device.msg", &[Feature::Messaging]),
	]);
	assert!(registry.refresh().await.unwrap());
	assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn refresh_failure_keeps_cache() {
	let directory = MockDirectory::new(vec![device_entry("com.device.tel", &[Feature::Voice])]);
	let mut registry = CandidateRegistry::new(directory.clone());
	registry.refresh().await.unwrap();

	directory.set_fail(true);
	assert!(registry.refresh().await.is_err());
	// Transient failure: the previous snapshot stays valid until the next
	// successful refresh.
	assert!(registry.get("com.device.tel").is_some());
}

#[tokio::test]
async fn carrier_manifest_declarations_are_never_trusted() {
	let directory = MockDirectory::new(vec![carrier_entry(
		"com.carrier.ims",
		&[Feature::Voice, Feature::Messaging, Feature::EmergencyVoice],
	)]);
	let mut registry = CandidateRegistry::new(directory);
	registry.refresh().await.unwrap();

	let info = registry.get("com.carrier.ims").unwrap();
	assert!(info.requires_dynamic_query);
	assert!(info.static_features.is_empty());
	assert_eq!(registry.device_defaults_for(Feature::Voice).count(), 0);
}

#[tokio::test]
async fn package_changed_updates_only_that_entry() {
	let directory = MockDirectory::new(vec![
		device_entry("com.device.tel", &[Feature::Voice]),
		device_entry("com.device.msg", &[Feature::Messaging]),
	]);
	let mut registry = CandidateRegistry::new(directory.clone());
	registry.refresh().await.unwrap();

	directory.set_entries(vec![
		device_entry("com.device.tel", &[Feature::Voice, Feature::Messaging]),
		device_entry("com.device.msg", &[Feature::Messaging]),
	]);
	assert!(registry.on_package_changed("com.device.tel").await.unwrap());
	assert!(!registry.on_package_changed("com.device.msg").await.unwrap());
	assert_eq!(
		registry.get("com.device.tel").unwrap().static_features.len(),
		2
	);
}

#[tokio::test]
async fn package_changed_to_missing_evicts() {
	let directory = MockDirectory::new(vec![device_entry("com.device.tel", &[Feature::Voice])]);
	let mut registry = CandidateRegistry::new(directory.clone());
	registry.refresh().await.unwrap();

	directory.set_entries(vec![]);
	assert!(registry.on_package_changed("com.device.tel").await.unwrap());
	assert!(registry.is_empty());
	assert!(!registry.on_package_removed("com.device.tel"));
}

#[tokio::test]
async fn device_defaults_iterate_in_package_order() {
	let directory = MockDirectory::new(vec![
		device_entry("com.vendor.b", &[Feature::Voice]),
		device_entry("com.vendor.a", &[Feature::Voice]),
	]);
	let mut registry = CandidateRegistry::new(directory);
	registry.refresh().await.unwrap();

	let packages: Vec<_> = registry
		.device_defaults_for(Feature::Voice)
		.map(|info| info.package.as_str())
		.collect();
	assert_eq!(packages, vec!["com.vendor.a", "com.vendor.b"]);
}
