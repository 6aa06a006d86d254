//! Per-package service controller.
//!
//! One controller owns the logical connection to one remote service
//! implementation and runs its connection state machine, including crash
//! recovery. Controllers are owned and driven by the resolver loop; every
//! method here is called from that single serialized task, so the state
//! machine needs no internal locking.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backoff::RebindBackoff;
use crate::feature::SlotFeatureKey;
use crate::repository::FeatureRepository;
use crate::transport::{BindFlags, ConnectionId, ServiceTransport};
use crate::{Error, Result};

/// Connection state of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
	/// No connection and none requested.
	Unbound,
	/// Bind requested; waiting for the platform's connected callback.
	Binding,
	/// Connected to a live remote implementation.
	Connected,
	/// Connection lost unexpectedly; an automatic rebind timer is pending.
	RebindScheduled,
	/// Terminal failure (refused bind or null remote handle). Only an
	/// explicit external bind recovers from this state.
	PermanentError,
}

/// Observer of per-feature lifecycle on a bound service.
pub trait ControllerListener: Send + Sync {
	/// A feature was created and its handle published.
	fn on_feature_created(&self, package: &str, key: SlotFeatureKey);

	/// A feature was removed and its handle withdrawn.
	fn on_feature_removed(&self, package: &str, key: SlotFeatureKey);
}

/// Listener that ignores all notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopControllerListener;

impl ControllerListener for NoopControllerListener {
	fn on_feature_created(&self, _package: &str, _key: SlotFeatureKey) {}
	fn on_feature_removed(&self, _package: &str, _key: SlotFeatureKey) {}
}

/// Deferred rebind notice a controller schedules for itself.
///
/// Delivered back to the resolver loop, which routes it to the owning
/// controller. The generation guards against superseded timers: any explicit
/// `bind`/`unbind` bumps the controller's generation, rendering older notices
/// inert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebindDue {
	/// Package whose controller scheduled the rebind.
	pub package: String,
	/// Timer generation at scheduling time.
	pub generation: u64,
}

/// State machine for the connection to one candidate package.
pub struct ServiceController {
	package: String,
	transport: Arc<dyn ServiceTransport>,
	repository: Arc<FeatureRepository>,
	listener: Arc<dyn ControllerListener>,
	rebind_tx: mpsc::UnboundedSender<RebindDue>,
	state: ControllerState,
	connection: Option<ConnectionId>,
	/// Keys the resolver wants bound on this package.
	target: BTreeSet<SlotFeatureKey>,
	/// Keys actually created on the remote implementation.
	held: BTreeSet<SlotFeatureKey>,
	backoff: RebindBackoff,
	rebind_generation: u64,
	rebind_timer: Option<AbortHandle>,
	/// Whether the in-progress bind came from an explicit `bind` call rather
	/// than an automatic rebind; an explicit bind that reaches the connected
	/// state resets the backoff.
	explicit_bind: bool,
}

impl ServiceController {
	/// Create an unbound controller for `package`.
	pub fn new(
		package: String,
		transport: Arc<dyn ServiceTransport>,
		repository: Arc<FeatureRepository>,
		listener: Arc<dyn ControllerListener>,
		rebind_tx: mpsc::UnboundedSender<RebindDue>,
	) -> Self {
		Self {
			package,
			transport,
			repository,
			listener,
			rebind_tx,
			state: ControllerState::Unbound,
			connection: None,
			target: BTreeSet::new(),
			held: BTreeSet::new(),
			backoff: RebindBackoff::new(),
			rebind_generation: 0,
			rebind_timer: None,
			explicit_bind: false,
		}
	}

	/// The package this controller manages.
	pub fn package(&self) -> &str {
		&self.package
	}

	/// Current connection state.
	pub fn state(&self) -> ControllerState {
		self.state
	}

	/// Keys the resolver currently wants bound here.
	pub fn target(&self) -> &BTreeSet<SlotFeatureKey> {
		&self.target
	}

	/// Keys actually live on the remote implementation.
	pub fn held(&self) -> &BTreeSet<SlotFeatureKey> {
		&self.held
	}

	/// Whether `connection` is this controller's current connection.
	pub fn owns_connection(&self, connection: ConnectionId) -> bool {
		self.connection == Some(connection)
	}

	/// Explicitly bind with `target`. Valid from any state; supersedes a
	/// pending rebind timer and recovers from [`ControllerState::PermanentError`].
	///
	/// # Errors
	///
	/// [`Error::BindRefused`] when the platform rejects the request; the
	/// controller enters [`ControllerState::PermanentError`].
	pub async fn bind(&mut self, target: BTreeSet<SlotFeatureKey>) -> Result<()> {
		if matches!(self.state, ControllerState::Binding | ControllerState::Connected) {
			self.change_features(target).await;
			return Ok(());
		}
		self.cancel_rebind();
		self.target = target;
		if self.target.is_empty() {
			debug!(package = %self.package, "bind with empty target; staying unbound");
			// The timer is gone, so a scheduled rebind can no longer happen.
			if self.state == ControllerState::RebindScheduled {
				self.state = ControllerState::Unbound;
			}
			return Ok(());
		}
		self.explicit_bind = true;
		self.request_bind().await
	}

	/// Replace the wanted key set.
	///
	/// While connected this diffs against the held set, creating added keys
	/// and removing dropped ones; a repeated call with an identical set
	/// performs zero remote calls. In other states the new target simply
	/// takes effect on the next (re)connect.
	pub async fn change_features(&mut self, target: BTreeSet<SlotFeatureKey>) {
		self.target = target;
		if self.state != ControllerState::Connected {
			return;
		}
		// Dependents sort after their dependencies, so removing in reverse
		// order tears down emergency voice before plain voice.
		let stale: Vec<SlotFeatureKey> = self.held.difference(&self.target).copied().collect();
		for key in stale.into_iter().rev() {
			self.remove_feature(key).await;
		}
		self.create_missing_features().await;
	}

	/// Tear down every held feature and the connection itself. Cancels any
	/// pending rebind timer. [`ControllerState::PermanentError`] is sticky;
	/// every other state ends at [`ControllerState::Unbound`].
	pub async fn unbind(&mut self) {
		self.cancel_rebind();
		self.target.clear();
		let remote_alive = self.state == ControllerState::Connected;
		self.drop_held_features(remote_alive).await;
		if let Some(connection) = self.connection.take() {
			if let Err(err) = self.transport.unbind(connection).await {
				debug!(package = %self.package, error = %err, "platform unbind failed");
			}
		}
		if self.state != ControllerState::PermanentError {
			if self.state != ControllerState::Unbound {
				info!(package = %self.package, "service unbound");
			}
			self.state = ControllerState::Unbound;
		}
	}

	/// Platform connected callback.
	///
	/// # Errors
	///
	/// [`Error::NullBinding`] when the platform delivered no remote handle;
	/// the controller enters [`ControllerState::PermanentError`] and the
	/// caller strips the package from candidacy.
	pub async fn on_connected(&mut self, connection: ConnectionId, remote: bool) -> Result<()> {
		if !self.owns_connection(connection) || self.state != ControllerState::Binding {
			debug!(package = %self.package, %connection, "dropping stale connected event");
			return Ok(());
		}
		if !remote {
			warn!(package = %self.package, "platform delivered a null remote handle");
			let _ = self.transport.unbind(connection).await;
			self.connection = None;
			self.state = ControllerState::PermanentError;
			return Err(Error::NullBinding(self.package.clone()));
		}
		self.state = ControllerState::Connected;
		if self.explicit_bind {
			self.backoff.reset();
		}
		info!(package = %self.package, %connection, "service connected");
		self.create_missing_features().await;
		Ok(())
	}

	/// Orderly remote disconnect: tear down held features, no automatic
	/// rebind.
	pub async fn on_disconnected(&mut self, connection: ConnectionId) {
		if !self.owns_connection(connection) {
			debug!(package = %self.package, %connection, "dropping stale disconnect event");
			return;
		}
		info!(package = %self.package, "service disconnected");
		self.drop_held_features(false).await;
		let _ = self.transport.unbind(connection).await;
		self.connection = None;
		self.state = ControllerState::Unbound;
	}

	/// Unexpected connection loss: tear down held features and schedule an
	/// automatic rebind after the backoff delay.
	pub async fn on_connection_lost(&mut self, connection: ConnectionId) {
		if !self.owns_connection(connection) {
			debug!(package = %self.package, %connection, "dropping stale connection-loss event");
			return;
		}
		self.drop_held_features(false).await;
		let _ = self.transport.unbind(connection).await;
		self.connection = None;
		self.state = ControllerState::RebindScheduled;
		self.schedule_rebind();
	}

	/// The backoff timer fired: re-issue the bind with the last-known target.
	///
	/// Notices from superseded timers (stale generation) are ignored.
	///
	/// # Errors
	///
	/// [`Error::BindRefused`] when the platform rejects the re-bind; the
	/// controller enters [`ControllerState::PermanentError`].
	pub async fn on_rebind_due(&mut self, generation: u64) -> Result<()> {
		if self.state != ControllerState::RebindScheduled || generation != self.rebind_generation {
			debug!(package = %self.package, generation, "ignoring superseded rebind timer");
			return Ok(());
		}
		self.rebind_timer = None;
		info!(package = %self.package, "rebinding after connection loss");
		self.explicit_bind = false;
		self.request_bind().await
	}

	async fn request_bind(&mut self) -> Result<()> {
		self.state = ControllerState::Binding;
		debug!(package = %self.package, target = %format_keys(&self.target), "requesting bind");
		match self.transport.request_bind(&self.package, BindFlags::default()).await {
			Ok(connection) => {
				self.connection = Some(connection);
				Ok(())
			}
			Err(err) => {
				warn!(package = %self.package, error = %err, "bind request refused");
				self.connection = None;
				self.state = ControllerState::PermanentError;
				Err(err)
			}
		}
	}

	/// Create every target key not yet held, in sorted order so dependencies
	/// are created before their dependents. A key whose dependency is not
	/// held (missing from the batch, or failed creation) is skipped; a
	/// per-key remote error omits only that key.
	async fn create_missing_features(&mut self) {
		let Some(connection) = self.connection else {
			return;
		};
		for key in self.target.clone() {
			if self.held.contains(&key) {
				continue;
			}
			if let Some(dependency) = key.dependency()
				&& !self.held.contains(&dependency)
			{
				debug!(package = %self.package, %key, %dependency, "skipping feature without its dependency");
				continue;
			}
			match self.transport.create_feature(connection, key).await {
				Ok(handle) => {
					self.repository.publish(key, handle);
					self.held.insert(key);
					self.listener.on_feature_created(&self.package, key);
					debug!(package = %self.package, %key, "feature created");
				}
				Err(err) => {
					warn!(package = %self.package, %key, error = %err, "feature creation failed; omitting key");
				}
			}
		}
	}

	async fn remove_feature(&mut self, key: SlotFeatureKey) {
		if let Some(connection) = self.connection {
			if let Err(err) = self.transport.remove_feature(connection, key).await {
				debug!(package = %self.package, %key, error = %err, "remote feature removal failed");
			}
			// Ownership-guarded: a key that already changed hands stays
			// published for its new owner.
			self.repository.withdraw(key, connection);
		}
		self.held.remove(&key);
		self.listener.on_feature_removed(&self.package, key);
	}

	/// Drop every held feature locally, notifying listeners. Remote removal
	/// calls are only issued when the remote side is still alive.
	async fn drop_held_features(&mut self, remote_alive: bool) {
		let remote = if remote_alive { self.connection } else { None };
		let held = std::mem::take(&mut self.held);
		for key in held.into_iter().rev() {
			if let Some(connection) = remote
				&& let Err(err) = self.transport.remove_feature(connection, key).await
			{
				debug!(package = %self.package, %key, error = %err, "remote feature removal failed");
			}
			if let Some(connection) = self.connection {
				self.repository.withdraw(key, connection);
			}
			self.listener.on_feature_removed(&self.package, key);
		}
	}

	fn schedule_rebind(&mut self) {
		self.rebind_generation += 1;
		let generation = self.rebind_generation;
		let delay = self.backoff.next_delay();
		let package = self.package.clone();
		let tx = self.rebind_tx.clone();
		info!(package = %self.package, delay_ms = delay.as_millis() as u64, "scheduling automatic rebind");
		let task = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let _ = tx.send(RebindDue { package, generation });
		});
		self.rebind_timer = Some(task.abort_handle());
	}

	fn cancel_rebind(&mut self) {
		self.rebind_generation += 1;
		if let Some(timer) = self.rebind_timer.take() {
			timer.abort();
		}
	}
}

fn format_keys(keys: &BTreeSet<SlotFeatureKey>) -> String {
	let mut out = String::new();
	for key in keys {
		if !out.is_empty() {
			out.push_str(", ");
		}
		out.push_str(&key.to_string());
	}
	out
}
