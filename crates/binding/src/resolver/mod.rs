//! Arbitration core.
//!
//! The resolver consumes the candidate registry, the carrier override map,
//! and dynamic query results, computes the authoritative
//! (slot, feature) → package assignment, and drives per-package service
//! controllers to converge on it with the minimal set of
//! bind/change-features/unbind operations.
//!
//! All state lives behind a single serialized event loop: external inputs
//! (package broadcasts, configuration changes, query results, platform
//! connection callbacks, rebind timers) are marshalled as [`ResolverEvent`]s
//! onto one queue and processed strictly in arrival order, so a recompute
//! triggered by event N observes the cumulative effect of everything that
//! arrived before N.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::candidate::{CandidateRegistry, DirectoryQuery, ServiceInfo};
use crate::carrier::{CarrierConfigSource, OverrideResolver};
use crate::controller::{ControllerListener, ControllerState, RebindDue, ServiceController};
use crate::feature::{Feature, SlotFeatureKey, SlotIndex};
use crate::query::{FeatureQueryManager, QueryListener, QueryOutcome};
use crate::repository::FeatureRepository;
use crate::transport::{ConnectionEvent, ServiceTransport};
use crate::{Error, Result};

/// The (slot, feature) → package plan, keyed by package for diffing against
/// controller targets.
pub type Assignment = BTreeMap<String, BTreeSet<SlotFeatureKey>>;

/// Events processed by the resolver loop.
#[derive(Debug)]
pub enum ResolverEvent {
	/// Re-query the package directory for all candidates.
	DirectoryRefresh,
	/// A package was installed, updated, or otherwise changed.
	PackageChanged(String),
	/// A package was removed.
	PackageRemoved(String),
	/// Carrier configuration changed for one slot.
	CarrierConfigChanged(SlotIndex),
	/// The number of active SIM slots changed.
	SlotCountChanged(u8),
	/// Device boot completed; configuration and candidates may now be
	/// available.
	BootCompleted,
	/// A dynamic feature query settled.
	QueryComplete {
		/// Queried package.
		package: String,
		/// Terminal outcome.
		outcome: QueryOutcome,
	},
	/// A platform connection callback.
	Connection(ConnectionEvent),
	/// A controller's rebind backoff timer fired.
	RebindDue(RebindDue),
	/// Explicit external re-bind of a package, recovering it from permanent
	/// error.
	RebindPackage(String),
	/// Introspection request.
	Snapshot(oneshot::Sender<ResolverSnapshot>),
	/// Unbind everything and stop the loop.
	Shutdown,
}

/// Point-in-time view of resolver state, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct ResolverSnapshot {
	/// Current (slot, feature) → package plan, keyed by package.
	pub assignment: Assignment,
	/// Connection state per live controller.
	pub controllers: BTreeMap<String, ControllerState>,
	/// Keys actually held per live controller.
	pub held: BTreeMap<String, BTreeSet<SlotFeatureKey>>,
	/// Packages with an outstanding dynamic query.
	pub pending_queries: Vec<String>,
	/// Packages stripped from candidacy by a permanent error.
	pub denylisted: BTreeSet<String>,
}

impl ResolverSnapshot {
	/// The package holding `key`, if any controller has it in its held set.
	pub fn holder_of(&self, key: SlotFeatureKey) -> Option<&str> {
		self.held
			.iter()
			.find(|(_, keys)| keys.contains(&key))
			.map(|(package, _)| package.as_str())
	}
}

/// Cloneable handle injecting events into the resolver loop.
#[derive(Clone)]
pub struct ResolverHandle {
	tx: mpsc::UnboundedSender<ResolverEvent>,
}

impl ResolverHandle {
	fn send(&self, event: ResolverEvent) -> Result<()> {
		self.tx.send(event).map_err(|_| Error::ResolverStopped)
	}

	/// Request a full directory refresh.
	pub fn refresh(&self) -> Result<()> {
		self.send(ResolverEvent::DirectoryRefresh)
	}

	/// Report a package-changed broadcast.
	pub fn package_changed(&self, package: impl Into<String>) -> Result<()> {
		self.send(ResolverEvent::PackageChanged(package.into()))
	}

	/// Report a package-removed broadcast.
	pub fn package_removed(&self, package: impl Into<String>) -> Result<()> {
		self.send(ResolverEvent::PackageRemoved(package.into()))
	}

	/// Report a per-slot carrier configuration change.
	pub fn carrier_config_changed(&self, slot: SlotIndex) -> Result<()> {
		self.send(ResolverEvent::CarrierConfigChanged(slot))
	}

	/// Report a change in the number of active slots.
	pub fn slot_count_changed(&self, count: u8) -> Result<()> {
		self.send(ResolverEvent::SlotCountChanged(count))
	}

	/// Report boot completion.
	pub fn boot_completed(&self) -> Result<()> {
		self.send(ResolverEvent::BootCompleted)
	}

	/// Explicitly re-bind a package, clearing its permanent-error state.
	pub fn rebind_package(&self, package: impl Into<String>) -> Result<()> {
		self.send(ResolverEvent::RebindPackage(package.into()))
	}

	/// Stop the loop after unbinding everything.
	pub fn shutdown(&self) -> Result<()> {
		self.send(ResolverEvent::Shutdown)
	}

	/// Fetch a point-in-time snapshot of resolver state.
	///
	/// # Errors
	///
	/// [`Error::ResolverStopped`] if the loop is gone.
	pub async fn snapshot(&self) -> Result<ResolverSnapshot> {
		let (tx, rx) = oneshot::channel();
		self.send(ResolverEvent::Snapshot(tx))?;
		rx.await.map_err(|_| Error::ResolverStopped)
	}
}

/// Forwards query results onto the resolver queue.
struct QueryForwarder {
	tx: mpsc::UnboundedSender<ResolverEvent>,
}

impl QueryListener for QueryForwarder {
	fn on_complete(&self, package: &str, keys: BTreeSet<SlotFeatureKey>) {
		let _ = self.tx.send(ResolverEvent::QueryComplete {
			package: package.to_owned(),
			outcome: QueryOutcome::Features(keys),
		});
	}

	fn on_permanent_error(&self, package: &str) {
		let _ = self.tx.send(ResolverEvent::QueryComplete {
			package: package.to_owned(),
			outcome: QueryOutcome::PermanentFailure,
		});
	}
}

/// The arbitration core. Owns the candidate registry, the override resolver,
/// the query manager, and every service controller.
pub struct Resolver {
	registry: CandidateRegistry,
	overrides: OverrideResolver,
	queries: FeatureQueryManager,
	transport: Arc<dyn ServiceTransport>,
	repository: Arc<FeatureRepository>,
	listener: Arc<dyn ControllerListener>,
	controllers: BTreeMap<String, ServiceController>,
	query_results: HashMap<String, QueryOutcome>,
	denylist: BTreeSet<String>,
	assignment: Assignment,
	slot_count: u8,
	tx: mpsc::UnboundedSender<ResolverEvent>,
	rx: mpsc::UnboundedReceiver<ResolverEvent>,
	rebind_tx: mpsc::UnboundedSender<RebindDue>,
	rebind_rx: Option<mpsc::UnboundedReceiver<RebindDue>>,
}

impl Resolver {
	/// Wire up a resolver and its handle.
	pub fn new(
		transport: Arc<dyn ServiceTransport>,
		directory: Arc<dyn DirectoryQuery>,
		carrier_config: Arc<dyn CarrierConfigSource>,
		repository: Arc<FeatureRepository>,
		listener: Arc<dyn ControllerListener>,
		slot_count: u8,
	) -> (Self, ResolverHandle) {
		let (tx, rx) = mpsc::unbounded_channel();
		let (rebind_tx, rebind_rx) = mpsc::unbounded_channel();
		let queries = FeatureQueryManager::new(
			transport.clone(),
			Arc::new(QueryForwarder { tx: tx.clone() }),
		);
		let resolver = Self {
			registry: CandidateRegistry::new(directory),
			overrides: OverrideResolver::new(carrier_config),
			queries,
			transport,
			repository,
			listener,
			controllers: BTreeMap::new(),
			query_results: HashMap::new(),
			denylist: BTreeSet::new(),
			assignment: Assignment::new(),
			slot_count,
			tx: tx.clone(),
			rx,
			rebind_tx,
			rebind_rx: Some(rebind_rx),
		};
		(resolver, ResolverHandle { tx })
	}

	/// Drive the event loop until shutdown.
	///
	/// Performs an initial candidate refresh, override computation, and
	/// recompute before processing events.
	pub async fn run(mut self) {
		self.spawn_forwarders();

		if let Err(err) = self.registry.refresh().await {
			warn!(error = %err, "initial candidate refresh failed; retrying on next refresh");
		}
		self.overrides.recompute_all(self.slot_count).await;
		self.recompute().await;

		while let Some(event) = self.rx.recv().await {
			if self.handle_event(event).await.is_break() {
				break;
			}
		}
		info!("resolver loop stopped");
	}

	/// Marshal platform connection events and rebind timers onto the main
	/// queue so everything is processed in one serialized order.
	fn spawn_forwarders(&mut self) {
		let mut connection_events = self.transport.events();
		let tx = self.tx.clone();
		tokio::spawn(async move {
			while let Some(event) = connection_events.recv().await {
				if tx.send(ResolverEvent::Connection(event)).is_err() {
					break;
				}
			}
		});

		let mut rebind_rx = self.rebind_rx.take().expect("run called twice");
		let tx = self.tx.clone();
		tokio::spawn(async move {
			while let Some(due) = rebind_rx.recv().await {
				if tx.send(ResolverEvent::RebindDue(due)).is_err() {
					break;
				}
			}
		});
	}

	async fn handle_event(&mut self, event: ResolverEvent) -> ControlFlow<()> {
		match event {
			ResolverEvent::DirectoryRefresh => match self.registry.refresh().await {
				Ok(true) => self.recompute().await,
				Ok(false) => {}
				Err(err) => warn!(error = %err, "candidate refresh failed"),
			},
			ResolverEvent::PackageChanged(package) => {
				// A changed package may have changed its true capabilities;
				// forget the old query result and re-probe on demand.
				self.queries.cancel(&package);
				self.query_results.remove(&package);
				match self.registry.on_package_changed(&package).await {
					Ok(_) => self.recompute().await,
					Err(err) => warn!(package = %package, error = %err, "package re-query failed"),
				}
			}
			ResolverEvent::PackageRemoved(package) => {
				self.queries.cancel(&package);
				self.query_results.remove(&package);
				self.denylist.remove(&package);
				self.registry.on_package_removed(&package);
				self.recompute().await;
			}
			ResolverEvent::CarrierConfigChanged(slot) => {
				if slot.0 >= self.slot_count {
					debug!(%slot, slot_count = self.slot_count, "ignoring config change for inactive slot");
				} else if self.overrides.recompute_slot(slot).await {
					self.recompute().await;
				}
			}
			ResolverEvent::SlotCountChanged(count) => {
				info!(count, "slot count changed");
				self.slot_count = count;
				self.overrides.recompute_all(count).await;
				self.recompute().await;
			}
			ResolverEvent::BootCompleted => {
				if let Err(err) = self.registry.refresh().await {
					warn!(error = %err, "candidate refresh failed at boot");
				}
				self.overrides.recompute_all(self.slot_count).await;
				self.recompute().await;
			}
			ResolverEvent::QueryComplete { package, outcome } => {
				debug!(package = %package, ?outcome, "dynamic query settled");
				self.query_results.insert(package, outcome);
				self.recompute().await;
			}
			ResolverEvent::Connection(event) => self.on_connection_event(event).await,
			ResolverEvent::RebindDue(due) => {
				if let Some(controller) = self.controllers.get_mut(&due.package) {
					if controller.on_rebind_due(due.generation).await.is_err() {
						self.strip_candidacy(due.package.clone()).await;
					}
				}
			}
			ResolverEvent::RebindPackage(package) => {
				info!(package = %package, "explicit rebind requested");
				self.denylist.remove(&package);
				self.query_results.remove(&package);
				self.recompute().await;
			}
			ResolverEvent::Snapshot(reply) => {
				let _ = reply.send(self.snapshot());
			}
			ResolverEvent::Shutdown => {
				for controller in self.controllers.values_mut() {
					controller.unbind().await;
				}
				self.controllers.clear();
				return ControlFlow::Break(());
			}
		}
		ControlFlow::Continue(())
	}

	async fn on_connection_event(&mut self, event: ConnectionEvent) {
		let connection = match event {
			ConnectionEvent::Connected { connection, .. }
			| ConnectionEvent::Disconnected { connection }
			| ConnectionEvent::ConnectionLost { connection } => connection,
		};
		let Some(package) = self
			.controllers
			.values()
			.find(|c| c.owns_connection(connection))
			.map(|c| c.package().to_owned())
		else {
			debug!(%connection, "dropping event for unknown connection");
			return;
		};
		let controller = self.controllers.get_mut(&package).expect("controller exists");
		match event {
			ConnectionEvent::Connected { remote, .. } => {
				if controller.on_connected(connection, remote).await.is_err() {
					self.strip_candidacy(package).await;
				}
			}
			ConnectionEvent::Disconnected { .. } => controller.on_disconnected(connection).await,
			ConnectionEvent::ConnectionLost { .. } => controller.on_connection_lost(connection).await,
		}
	}

	/// Remove a permanently failed package from candidacy and re-arbitrate.
	/// The package stays stripped until an explicit external rebind.
	async fn strip_candidacy(&mut self, package: String) {
		warn!(package = %package, "stripping package from candidacy after permanent error");
		self.denylist.insert(package);
		self.recompute().await;
	}

	/// Recompute the global assignment and converge the controllers on it.
	///
	/// Bind refusals discovered while converging strip the refusing package
	/// and re-arbitrate; the denylist only grows within one recompute, so
	/// this settles in at most a handful of passes.
	async fn recompute(&mut self) {
		loop {
			let (assignment, queries_needed) = self.compute_assignment();
			for package in queries_needed {
				self.ensure_query(&package);
			}
			let refused = self.apply(assignment).await;
			if refused.is_empty() {
				break;
			}
			for package in refused {
				warn!(package = %package, "stripping package from candidacy after refused bind");
				self.denylist.insert(package);
			}
		}
	}

	/// Compute the (slot, feature) → package plan from current inputs.
	///
	/// Independent features first: a confirmed carrier override wins,
	/// an unconfirmed one (query pending) leaves the key unassigned rather
	/// than falling back prematurely, anything else goes to the first
	/// device default able to provide the feature. Dependent features are
	/// granted last, only to the holder of their dependency.
	fn compute_assignment(&self) -> (Assignment, BTreeSet<String>) {
		let mut assignment = Assignment::new();
		let mut queries_needed = BTreeSet::new();

		for slot in (0..self.slot_count).map(SlotIndex) {
			for feature in Feature::independent() {
				let key = SlotFeatureKey { slot, feature };
				if let Some(package) = self.overrides.map().override_for(key)
					&& !self.denylist.contains(package)
					&& let Some(info) = self.registry.get(package)
				{
					match self.effective_supports(info, key) {
						Some(true) => {
							assignment.entry(package.to_owned()).or_default().insert(key);
							continue;
						}
						// Confirmed unsupported: fall back to device default.
						Some(false) => {}
						// Query pending: hold the key open.
						None => {
							queries_needed.insert(package.to_owned());
							continue;
						}
					}
				}
				if let Some(info) = self
					.registry
					.device_defaults_for(feature)
					.find(|info| !self.denylist.contains(&info.package))
				{
					assignment.entry(info.package.clone()).or_default().insert(key);
				} else {
					debug!(%key, "no provider available");
				}
			}
		}

		// Dependent features ride with their dependency's holder, and only
		// when that holder is confirmed to support them.
		for slot in (0..self.slot_count).map(SlotIndex) {
			for feature in Feature::ALL {
				let Some(dependency) = feature.depends_on() else {
					continue;
				};
				let key = SlotFeatureKey { slot, feature };
				let dependency_key = SlotFeatureKey { slot, feature: dependency };
				let holder = assignment
					.iter()
					.find(|(_, keys)| keys.contains(&dependency_key))
					.map(|(package, _)| package.clone());
				if let Some(package) = holder
					&& let Some(info) = self.registry.get(&package)
					&& self.effective_supports(info, key) == Some(true)
				{
					assignment.entry(package).or_default().insert(key);
				}
			}
		}

		(assignment, queries_needed)
	}

	/// Whether `info`'s effective feature set includes `key`.
	///
	/// `None` means unknown: the package requires a dynamic query whose
	/// result has not arrived yet.
	fn effective_supports(&self, info: &ServiceInfo, key: SlotFeatureKey) -> Option<bool> {
		if !info.requires_dynamic_query {
			return Some(info.static_features.contains(&key.feature));
		}
		match self.query_results.get(&info.package) {
			Some(QueryOutcome::Features(keys)) => Some(keys.contains(&key)),
			Some(QueryOutcome::PermanentFailure) => Some(false),
			None => None,
		}
	}

	fn ensure_query(&self, package: &str) {
		if !self.query_results.contains_key(package) {
			self.queries.start_query(package);
		}
	}

	/// Diff the new assignment against controller targets and issue the
	/// minimal bind/change-features/unbind calls. Returns packages whose
	/// bind request was refused.
	async fn apply(&mut self, assignment: Assignment) -> Vec<String> {
		self.assignment = assignment;
		let mut refused = Vec::new();
		let packages: BTreeSet<String> = self
			.controllers
			.keys()
			.chain(self.assignment.keys())
			.cloned()
			.collect();

		for package in packages {
			let desired = self.assignment.get(&package).cloned().unwrap_or_default();
			if desired.is_empty() {
				if let Some(controller) = self.controllers.get_mut(&package) {
					let needs_teardown = !controller.target().is_empty()
						|| matches!(
							controller.state(),
							ControllerState::Binding
								| ControllerState::Connected
								| ControllerState::RebindScheduled
						);
					if needs_teardown {
						controller.unbind().await;
					}
					// A controller is destroyed once its package has left the
					// candidate set and it is fully unbound.
					if self.registry.get(&package).is_none() {
						self.controllers.remove(&package);
					}
				}
				continue;
			}

			if !self.controllers.contains_key(&package) {
				let controller = ServiceController::new(
					package.clone(),
					self.transport.clone(),
					self.repository.clone(),
					self.listener.clone(),
					self.rebind_tx.clone(),
				);
				self.controllers.insert(package.clone(), controller);
			}
			let controller = self.controllers.get_mut(&package).expect("just inserted");
			match controller.state() {
				ControllerState::Unbound | ControllerState::PermanentError => {
					if controller.bind(desired).await.is_err() {
						refused.push(package);
					}
				}
				ControllerState::Binding
				| ControllerState::Connected
				| ControllerState::RebindScheduled => controller.change_features(desired).await,
			}
		}
		refused
	}

	fn snapshot(&self) -> ResolverSnapshot {
		ResolverSnapshot {
			assignment: self.assignment.clone(),
			controllers: self
				.controllers
				.iter()
				.map(|(package, c)| (package.clone(), c.state()))
				.collect(),
			held: self
				.controllers
				.iter()
				.map(|(package, c)| (package.clone(), c.held().clone()))
				.collect(),
			pending_queries: self.queries.outstanding(),
			denylisted: self.denylist.clone(),
		}
	}
}
