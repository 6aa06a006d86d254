//! Per-slot telephony feature service resolution and binding.
//!
//! For every (radio slot, telephony feature) pair on a device, exactly one
//! installed service implementation may be authoritative at a time. This crate
//! decides which one, and manages the live connection to it. Inputs are the
//! set of installed candidate packages, per-slot carrier override preferences,
//! and feature sets obtained either from a static manifest declaration or from
//! an asynchronous capability query.
//!
//! The main pieces:
//!
//! - [`candidate::CandidateRegistry`]: discovers and caches installed packages
//!   advertising the service interface.
//! - [`carrier::OverrideResolver`]: maps each (slot, feature) to the
//!   carrier-preferred package, from per-subscription configuration.
//! - [`query::FeatureQueryManager`]: probes packages whose declared features
//!   cannot be trusted statically.
//! - [`resolver::Resolver`]: the arbitration core. Consumes the above,
//!   computes the authoritative (slot, feature) → package assignment, and
//!   drives per-package [`controller::ServiceController`]s to converge on it.
//! - [`repository::FeatureRepository`]: the process-wide store of live remote
//!   feature handles, read by external feature consumers.
//!
//! All resolver and controller state is mutated from a single serialized event
//! loop ([`resolver::Resolver::run`]); external collaborators inject events
//! through a cloneable [`resolver::ResolverHandle`].

pub mod backoff;
pub mod candidate;
pub mod carrier;
pub mod controller;
pub mod feature;
pub mod query;
pub mod repository;
pub mod resolver;
pub mod transport;

pub use candidate::{CandidateRegistry, DirectoryEntry, DirectoryQuery, ServiceInfo};
pub use carrier::{CarrierConfig, CarrierConfigSource, CarrierOverrideMap, OverrideResolver};
pub use controller::{ControllerListener, ControllerState, NoopControllerListener, ServiceController};
pub use feature::{Feature, SlotFeatureKey, SlotIndex};
pub use query::{FeatureQueryManager, QueryListener, QueryOutcome};
pub use repository::FeatureRepository;
pub use resolver::{Resolver, ResolverHandle, ResolverSnapshot};
pub use transport::{BindFlags, ConnectionEvent, ConnectionId, FeatureHandle, ServiceTransport};

/// Errors produced by the binding subsystem.
///
/// Transient errors are retried locally by the component that detected them;
/// permanent errors propagate exactly one level up (controller → resolver),
/// which strips the affected package from candidacy. Nothing here is surfaced
/// interactively; failures manifest only as altered binding state plus
/// diagnostic logging.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// The external package directory could not be queried. Transient;
	/// retried on the next directory refresh.
	#[error("candidate query failed: {0}")]
	CandidateQuery(String),
	/// A single capability query attempt exceeded its timeout. Internal to
	/// the query retry loop; escalates to [`Error::PermanentQueryFailure`]
	/// once the attempt budget is spent.
	#[error("feature query timed out")]
	QueryTimeout,
	/// A capability query failed terminally (explicit failure reply, null
	/// remote handle, or exhausted retry budget).
	#[error("feature query permanently failed for {0}")]
	PermanentQueryFailure(String),
	/// The platform refused the bind request outright. Permanent; no feature
	/// creation is attempted.
	#[error("bind request refused for {0}")]
	BindRefused(String),
	/// The platform reported a null remote handle on connect. Permanent;
	/// recovery requires an explicit external re-bind.
	#[error("null binding result for {0}")]
	NullBinding(String),
	/// The connection to a bound implementation was lost unexpectedly.
	/// Recoverable; triggers an automatic rebind with backoff.
	#[error("connection lost to {0}")]
	ConnectionLost(String),
	/// The remote implementation failed to create one feature. Scoped to that
	/// key; sibling keys in the same batch are unaffected.
	#[error("feature creation failed for {key}: {reason}")]
	FeatureCreation {
		/// The (slot, feature) key whose creation failed.
		key: SlotFeatureKey,
		/// Remote-supplied failure description.
		reason: String,
	},
	/// The resolver event loop is no longer running.
	#[error("resolver stopped")]
	ResolverStopped,
}

/// Alias for `Result` with this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
