//! Platform connection interface.
//!
//! [`ServiceTransport`] is the seam between this subsystem and the platform's
//! component-binding machinery. A bind *request* completes quickly; connection
//! establishment, orderly disconnects, and unexpected losses arrive later on
//! the transport's event stream and are routed to the owning controller by the
//! resolver loop.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;
use crate::feature::SlotFeatureKey;

/// Identifier for one live connection. Unique per bind request, never reused,
/// so events carrying a stale id can be detected and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Binding flags forwarded with a bind request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindFlags {
	/// Create the remote component if it is not already running.
	pub auto_create: bool,
	/// Bind at foreground priority.
	pub foreground_priority: bool,
	/// Mark the binding as important to the remote process's lifetime.
	pub important: bool,
}

impl Default for BindFlags {
	fn default() -> Self {
		Self {
			auto_create: true,
			foreground_priority: true,
			important: true,
		}
	}
}

/// Live reference to a created feature instance on a bound implementation.
///
/// Published into the [`crate::repository::FeatureRepository`] while the
/// feature is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureHandle {
	/// Connection the feature lives on.
	pub connection: ConnectionId,
	/// The (slot, feature) key the handle serves.
	pub key: SlotFeatureKey,
}

/// Connection lifecycle events delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
	/// The platform resolved the bind request. `remote` is `false` when the
	/// platform reports a null remote handle, which is a permanent error for
	/// the affected package.
	Connected {
		/// The connection the event is for.
		connection: ConnectionId,
		/// Whether a live remote handle was delivered.
		remote: bool,
	},
	/// The remote side disconnected in an orderly fashion. Held features are
	/// torn down and no automatic rebind occurs.
	Disconnected {
		/// The connection the event is for.
		connection: ConnectionId,
	},
	/// The connection was lost unexpectedly (remote process death). Held
	/// features are torn down and a rebind is scheduled with backoff.
	ConnectionLost {
		/// The connection the event is for.
		connection: ConnectionId,
	},
}

/// Request/cancel connections to named components and operate on their remote
/// implementations.
///
/// Implementations spawn or attach to the actual remote component; tests use
/// in-memory mocks. All methods are quick: anything long-lived is reported via
/// the event stream.
#[async_trait]
pub trait ServiceTransport: Send + Sync {
	/// Take the connection event stream.
	///
	/// # Panics
	///
	/// May panic if called twice; there is exactly one consumer (the resolver
	/// loop).
	fn events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent>;

	/// Request a connection to `package`.
	///
	/// Returns as soon as the platform accepts the request; establishment is
	/// reported later as [`ConnectionEvent::Connected`].
	///
	/// # Errors
	///
	/// [`crate::Error::BindRefused`] if the platform rejects the request
	/// outright.
	async fn request_bind(&self, package: &str, flags: BindFlags) -> Result<ConnectionId>;

	/// Tear down a connection. Idempotent from the caller's point of view:
	/// unbinding an already-gone connection is not an error worth acting on.
	async fn unbind(&self, connection: ConnectionId) -> Result<()>;

	/// Ask the remote implementation to create the feature for `key`.
	///
	/// # Errors
	///
	/// [`crate::Error::FeatureCreation`] when the remote refuses this one key;
	/// the caller omits the key and continues with its siblings.
	async fn create_feature(&self, connection: ConnectionId, key: SlotFeatureKey) -> Result<FeatureHandle>;

	/// Ask the remote implementation to remove a previously created feature.
	async fn remove_feature(&self, connection: ConnectionId, key: SlotFeatureKey) -> Result<()>;

	/// One-shot capability probe against `package`.
	///
	/// Opens a minimal transient connection, invokes the feature-discovery
	/// entry point, and tears the connection down after the terminal result,
	/// regardless of outcome.
	///
	/// # Errors
	///
	/// [`crate::Error::NullBinding`] or [`crate::Error::BindRefused`] when no
	/// remote handle could be obtained; both are permanent for the caller.
	async fn query_features(&self, package: &str) -> Result<Vec<SlotFeatureKey>>;
}
