//! Dynamic feature query management.
//!
//! Carrier candidates (and any package flagged `requires_query`) cannot be
//! trusted to self-declare features, so their effective feature set comes
//! from a short-lived capability probe. The manager issues at most one probe
//! per package at a time, retries timeouts within a bounded attempt budget,
//! and reports exactly one terminal result per probe to its listener. The
//! transient connection behind a probe is torn down by the transport as soon
//! as the terminal result is in, regardless of outcome.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::feature::SlotFeatureKey;
use crate::transport::ServiceTransport;

/// Per-attempt probe timeout.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Attempt budget before a timed-out probe converts to a permanent failure.
pub const QUERY_ATTEMPTS: u32 = 3;

/// Terminal result of a capability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
	/// The package's true (slot, feature) support set.
	Features(BTreeSet<SlotFeatureKey>),
	/// The probe failed terminally; the package provides nothing until it is
	/// re-evaluated (package change or explicit rebind).
	PermanentFailure,
}

/// Receiver of terminal probe results.
pub trait QueryListener: Send + Sync {
	/// The probe discovered the package's supported keys.
	fn on_complete(&self, package: &str, keys: BTreeSet<SlotFeatureKey>);

	/// The probe failed terminally (explicit failure reply, null remote
	/// handle, or exhausted timeout budget).
	fn on_permanent_error(&self, package: &str);
}

struct InFlightQuery {
	id: u64,
	abort: AbortHandle,
}

/// Issues capability probes and serializes them per package.
///
/// Shared by `Arc`; the in-flight table uses interior mutability so probe
/// tasks can settle their own entries.
pub struct FeatureQueryManager {
	transport: Arc<dyn ServiceTransport>,
	listener: Arc<dyn QueryListener>,
	in_flight: Arc<Mutex<HashMap<String, InFlightQuery>>>,
	next_id: AtomicU64,
}

impl FeatureQueryManager {
	/// Create a manager delivering results to `listener`.
	pub fn new(transport: Arc<dyn ServiceTransport>, listener: Arc<dyn QueryListener>) -> Self {
		Self {
			transport,
			listener,
			in_flight: Arc::new(Mutex::new(HashMap::new())),
			next_id: AtomicU64::new(1),
		}
	}

	/// Start a probe for `package`.
	///
	/// Returns `false` (merging into the outstanding probe) when one is
	/// already in flight; a probe is never double-issued for a package.
	pub fn start_query(&self, package: &str) -> bool {
		let mut in_flight = self.in_flight.lock();
		if in_flight.contains_key(package) {
			debug!(package = %package, "feature query already in flight; merging");
			return false;
		}
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let task = tokio::spawn(Self::probe(
			self.transport.clone(),
			self.listener.clone(),
			self.in_flight.clone(),
			package.to_owned(),
			id,
		));
		// The probe task cannot settle before this insert: it needs the same
		// lock we are holding.
		in_flight.insert(
			package.to_owned(),
			InFlightQuery {
				id,
				abort: task.abort_handle(),
			},
		);
		debug!(package = %package, "feature query started");
		true
	}

	/// Whether a probe for `package` is outstanding.
	pub fn is_query_in_progress(&self, package: &str) -> bool {
		self.in_flight.lock().contains_key(package)
	}

	/// Packages with an outstanding probe, in name order.
	pub fn outstanding(&self) -> Vec<String> {
		let mut packages: Vec<String> = self.in_flight.lock().keys().cloned().collect();
		packages.sort();
		packages
	}

	/// Abort the outstanding probe for `package`, if any. No terminal result
	/// is delivered for an aborted probe.
	pub fn cancel(&self, package: &str) -> bool {
		match self.in_flight.lock().remove(package) {
			Some(entry) => {
				entry.abort.abort();
				debug!(package = %package, "feature query cancelled");
				true
			}
			None => false,
		}
	}

	async fn probe(
		transport: Arc<dyn ServiceTransport>,
		listener: Arc<dyn QueryListener>,
		in_flight: Arc<Mutex<HashMap<String, InFlightQuery>>>,
		package: String,
		id: u64,
	) {
		let mut attempt = 0;
		let outcome = loop {
			attempt += 1;
			match tokio::time::timeout(QUERY_TIMEOUT, transport.query_features(&package)).await {
				Ok(Ok(keys)) => break Ok(keys.into_iter().collect::<BTreeSet<_>>()),
				Ok(Err(err)) => {
					// Explicit failure reply or absent remote handle: no retry.
					warn!(package = %package, error = %err, "feature query failed permanently");
					break Err(());
				}
				Err(_) if attempt < QUERY_ATTEMPTS => {
					debug!(package = %package, attempt, "feature query timed out; retrying");
				}
				Err(_) => {
					warn!(package = %package, attempts = attempt, "feature query timeout budget exhausted");
					break Err(());
				}
			}
		};

		// Settle before notifying so a listener-triggered restart is not
		// rejected as a duplicate.
		{
			let mut in_flight = in_flight.lock();
			match in_flight.get(&package) {
				Some(entry) if entry.id == id => {
					in_flight.remove(&package);
				}
				// Superseded by cancel + restart; the newer probe owns the entry.
				_ => return,
			}
		}

		match outcome {
			Ok(keys) => listener.on_complete(&package, keys),
			Err(()) => listener.on_permanent_error(&package),
		}
	}
}
