use super::diagnostic::{coding_error, verify};
use super::index_proxy::Bookkeeping;
use super::population::{self, Scope};
use super::{
	AdapterRegistry, ChangeListener, DelegateConfig, DependencyIndex, ImagingError, IndexProxy, PrimAdapter,
	PrimInfoTable, QueryContext, Result, TOKENS, ValueCache, Worker,
};
use crate::hd::{self, DirtyBits};
use crate::{sdf, tf, usd, usd_geom, vt};
use glam::DMat4;
use std::sync::{Arc, Weak};

/// Where the delegate is in its synchronization cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
	/// Not populated yet.
	Idle,
	/// Scene edits are staged and waiting for [`Delegate::apply_pending_updates`].
	CollectingEdits,
	Resyncing,
	Repopulating,
	VariabilityTracking,
	/// Every staged edit has been applied.
	Clean,
}

/// Borrow the fields an [`IndexProxy`] needs, leaving the rest of the
/// delegate available.
macro_rules! index_proxy {
	($delegate:expr) => {
		IndexProxy::new(
			&$delegate.stage,
			&$delegate.registry,
			&$delegate.config,
			QueryContext::new($delegate.time, &$delegate.invised),
			&mut $delegate.render_index,
			&mut $delegate.book,
		)
	};
}

fn enter(state: &mut SyncState, next: SyncState) {
	log::trace!(target: "usd_imaging::changes", "{state:?} -> {next:?}");
	*state = next;
}

/// The prim and adapter behind a populated cache path.
fn populated_entry<'a>(index: &IndexProxy<'a>, cache_path: &sdf::Path) -> Option<(usd::Prim<'a>, Arc<dyn PrimAdapter>)> {
	let info = index.prim_info().get(cache_path)?;
	let prim = index.stage().prim_at_path(&info.usd_path)?;
	Some((prim, info.adapter.clone()))
}

/// Sorted resync roots with nested paths collapsed into their ancestor.
fn collapse_resyncs(mut paths: Vec<sdf::Path>) -> Vec<sdf::Path> {
	paths.sort();
	let mut roots: Vec<sdf::Path> = Vec::with_capacity(paths.len());
	for path in paths {
		if !roots.last().is_some_and(|root| path.has_prefix(root)) {
			roots.push(path);
		}
	}
	roots
}

/// Keeps a render index in sync with a [`usd::Stage`].
///
/// The delegate populates the index once from a root prim, then listens to
/// stage notices. Edits are staged until [`Delegate::apply_pending_updates`]
/// (or [`Delegate::set_time`]) turns them into resyncs and dirty bits, and
/// [`Delegate::sync_all`] pulls fresh values for everything dirty.
///
/// ```
/// use openusd_imaging::{hd, usd, usd_imaging};
///
/// let stage = usd::Stage::new();
/// stage.define_prim("/World/Cube", "Cube").unwrap();
///
/// let config = usd_imaging::DelegateConfig::default();
/// let mut delegate = usd_imaging::Delegate::new(stage.clone(), hd::MemoryRenderIndex::new(), config).unwrap();
/// delegate.populate("/World").unwrap();
/// delegate.sync_all();
/// assert!(delegate.render_index().has_rprim(&"/World/Cube".into()));
/// ```
pub struct Delegate<R: hd::RenderIndex> {
	stage: Arc<usd::Stage>,
	registry: AdapterRegistry,
	config: DelegateConfig,
	render_index: R,
	book: Bookkeeping,
	listener: Arc<ChangeListener>,
	worker: Worker,
	value_cache: ValueCache,
	root: Option<sdf::Path>,
	excluded: Vec<sdf::Path>,
	invised: Vec<sdf::Path>,
	time: usd::TimeCode,
	state: SyncState,
}

impl<R: hd::RenderIndex> Delegate<R> {
	/// A delegate using the built-in adapters.
	pub fn new(stage: Arc<usd::Stage>, render_index: R, config: DelegateConfig) -> Result<Self> {
		Self::with_registry(stage, render_index, AdapterRegistry::with_builtin(), config)
	}

	pub fn with_registry(
		stage: Arc<usd::Stage>,
		render_index: R,
		registry: AdapterRegistry,
		config: DelegateConfig,
	) -> Result<Self> {
		let worker = Worker::new(config.worker_threads)?;
		Ok(Self {
			excluded: config.excluded(),
			invised: config.invised(),
			stage,
			registry,
			config,
			render_index,
			book: Bookkeeping::default(),
			listener: Arc::new(ChangeListener::new()),
			worker,
			value_cache: ValueCache::new(),
			root: None,
			time: usd::TimeCode::DEFAULT,
			state: SyncState::Idle,
		})
	}

	/// Populate the render index with everything imageable below `root` and
	/// start listening for stage edits.
	pub fn populate(&mut self, root: impl Into<sdf::Path>) -> Result<()> {
		if self.root.is_some() {
			return Err(ImagingError::AlreadyPopulated);
		}
		let root = root.into();
		if !self.stage.prim_at_path(&root).is_some_and(|prim| !prim.is_in_prototype()) {
			return Err(ImagingError::InvalidRootPrim(root));
		}

		let listener: Weak<ChangeListener> = Arc::downgrade(&self.listener);
		self.stage.register_listener(listener);

		enter(&mut self.state, SyncState::Repopulating);
		let excluded = self.excluded.clone();
		{
			let mut index = index_proxy!(self);
			let scope = Scope {
				root: &root,
				excluded: &excluded,
			};
			population::populate(&mut index, std::slice::from_ref(&root), scope);
			index.process_removals();
		}
		log::debug!(
			target: "usd_imaging::changes",
			"Populated {} cache paths below <{root}>",
			self.book.prim_info.len()
		);
		self.root = Some(root);

		self.track_variability();
		enter(&mut self.state, SyncState::Clean);
		Ok(())
	}

	/// Turn every staged stage edit into render index changes.
	///
	/// Resyncs are processed before value changes. Repopulation requested
	/// along the way runs once at the end, followed by variability tracking
	/// of every new or changed cache path.
	pub fn apply_pending_updates(&mut self) {
		let Some(root) = self.root.clone() else {
			return;
		};
		let pending = self.listener.take();
		if pending.is_empty() && self.book.variability_requests.is_empty() {
			return;
		}
		self.value_cache.clear();

		enter(&mut self.state, SyncState::Resyncing);
		let excluded = self.excluded.clone();
		{
			let mut index = index_proxy!(self);

			for path in collapse_resyncs(pending.resync) {
				if path.is_property_path() {
					population::refresh_object(&mut index, &path, &[]);
				} else {
					population::resync_prim(&mut index, &path, false);
				}
			}
			index.process_removals();

			for (path, fields) in &pending.update {
				population::refresh_object(&mut index, path, fields);
				index.process_removals();
			}

			enter(&mut self.state, SyncState::Repopulating);
			let roots = index.take_paths_to_repopulate();
			if !roots.is_empty() {
				let scope = Scope {
					root: &root,
					excluded: &excluded,
				};
				population::populate(&mut index, &roots, scope);
				index.process_removals();
			}
		}

		self.track_variability();

		let Bookkeeping {
			prim_info, dependencies, ..
		} = &mut self.book;
		let collected = dependencies.garbage_collect(|cache_path| prim_info.contains(cache_path));
		if collected > 0 {
			log::debug!(target: "usd_imaging::changes", "Dropped {collected} stale dependencies");
		}
		enter(&mut self.state, SyncState::Clean);
	}

	fn track_variability(&mut self) {
		enter(&mut self.state, SyncState::VariabilityTracking);
		let query = QueryContext::new(self.time, &self.invised);
		self.worker.run_variability(&self.stage, &mut self.book, query);
	}

	/// Apply staged edits, then move to `time` and dirty everything that
	/// varies over time.
	pub fn set_time(&mut self, time: impl Into<usd::TimeCode>) {
		let time = time.into();
		self.apply_pending_updates();
		if time == self.time {
			return;
		}
		self.time = time;
		self.value_cache.clear();

		let prim_info = &self.book.prim_info;
		let time_varying = self
			.book
			.time_varying
			.get_or_insert_with(|| {
				prim_info
					.iter()
					.filter(|(_, info)| !info.time_varying_bits.is_clean())
					.map(|(cache_path, _)| cache_path.clone())
					.collect()
			})
			.clone();
		log::debug!(target: "usd_imaging::changes", "Time {time}: {} time-varying prims", time_varying.len());

		let mut index = index_proxy!(self);
		for cache_path in &time_varying {
			let bits = index.prim_info().get(cache_path).map(|info| info.time_varying_bits);
			if !verify!(bits.is_some(), "time-varying <{cache_path}> is not populated") {
				continue;
			}
			let Some((prim, adapter)) = populated_entry(&index, cache_path) else {
				continue;
			};
			adapter.mark_dirty(&prim, cache_path, bits.unwrap_or_default(), &mut index);
		}
	}

	pub fn time(&self) -> usd::TimeCode {
		self.time
	}

	/// Pull values for every dirty cache path at the current time. Returns
	/// the number of cache paths updated.
	pub fn sync_all(&mut self) -> usize {
		let query = QueryContext::new(self.time, &self.invised);
		self.worker
			.run_update(&self.stage, &mut self.book, query, &self.value_cache)
	}

	pub fn sync_state(&self) -> SyncState {
		if self.root.is_some() && self.listener.has_pending() {
			SyncState::CollectingEdits
		} else {
			self.state
		}
	}

	/// Force the prims below `paths` invisible, dirtying the visibility of
	/// everything whose invised state changes.
	pub fn set_invised_paths(&mut self, paths: Vec<sdf::Path>) {
		let changed: Vec<sdf::Path> = self
			.invised
			.iter()
			.filter(|path| !paths.contains(path))
			.chain(paths.iter().filter(|path| !self.invised.contains(path)))
			.cloned()
			.collect();
		if changed.is_empty() {
			return;
		}
		self.invised = paths;
		self.value_cache.clear();

		let mut index = index_proxy!(self);
		for path in changed {
			for cache_path in index.dependencies().gather(&path) {
				if let Some((prim, adapter)) = populated_entry(&index, &cache_path) {
					adapter.mark_visibility_dirty(&prim, &cache_path, &mut index);
				}
			}
		}
	}

	pub fn invised_paths(&self) -> &[sdf::Path] {
		&self.invised
	}

	pub fn set_root_visibility(&mut self, visible: bool) {
		if self.config.root_visible == visible {
			return;
		}
		self.config.root_visible = visible;

		let mut index = index_proxy!(self);
		for cache_path in index.prim_info().cache_paths() {
			if let Some((prim, adapter)) = populated_entry(&index, &cache_path) {
				adapter.mark_visibility_dirty(&prim, &cache_path, &mut index);
			}
		}
	}

	pub fn stage(&self) -> &Arc<usd::Stage> {
		&self.stage
	}

	pub fn config(&self) -> &DelegateConfig {
		&self.config
	}

	pub fn render_index(&self) -> &R {
		&self.render_index
	}

	pub fn render_index_mut(&mut self) -> &mut R {
		&mut self.render_index
	}

	pub fn prim_info(&self) -> &PrimInfoTable {
		&self.book.prim_info
	}

	pub fn dependencies(&self) -> &DependencyIndex {
		&self.book.dependencies
	}

	/// The listener staging this delegate's stage notices.
	pub fn listener(&self) -> &Arc<ChangeListener> {
		&self.listener
	}
}

/// Scene delegate queries. Values pulled by the last [`Delegate::sync_all`]
/// are served from the value cache; anything else is computed on demand.
impl<R: hd::RenderIndex> Delegate<R> {
	fn query(&self) -> QueryContext<'_> {
		QueryContext::new(self.time, &self.invised)
	}

	fn resolve(&self, cache_path: &sdf::Path) -> Option<(usd::Prim<'_>, Arc<dyn PrimAdapter>)> {
		let Some(info) = self.book.prim_info.get(cache_path) else {
			coding_error!("Query for unpopulated <{cache_path}>");
			return None;
		};
		let prim = self.stage.prim_at_path(&info.usd_path)?;
		Some((prim, info.adapter.clone()))
	}

	pub fn get_transform(&self, id: &sdf::Path) -> DMat4 {
		if let Some(transform) = self.value_cache.transform(id) {
			return transform;
		}
		self.resolve(id)
			.map(|(prim, adapter)| adapter.get_transform(&prim, id, &self.query()))
			.unwrap_or(DMat4::IDENTITY)
	}

	pub fn get_visible(&self, id: &sdf::Path) -> bool {
		if !self.config.root_visible {
			return false;
		}
		if let Some(visible) = self.value_cache.visible(id) {
			return visible;
		}
		self.resolve(id)
			.is_some_and(|(prim, adapter)| adapter.get_visible(&prim, id, &self.query()))
	}

	pub fn get(&self, id: &sdf::Path, key: &tf::Token) -> Option<vt::Value> {
		if let Some(value) = self.value_cache.value(id, key) {
			return Some(value);
		}
		let (prim, adapter) = self.resolve(id)?;
		adapter.get(&prim, id, key, &self.query())
	}

	pub fn get_topology(&self, id: &sdf::Path) -> Option<hd::Topology> {
		if let Some(topology) = self.value_cache.topology(id) {
			return Some(topology);
		}
		let (prim, adapter) = self.resolve(id)?;
		adapter.get_topology(&prim, id, &self.query())
	}

	pub fn get_extent(&self, id: &sdf::Path) -> hd::Range3d {
		if let Some(extent) = self.value_cache.extent(id) {
			return extent;
		}
		self.resolve(id)
			.map(|(prim, adapter)| adapter.get_extent(&prim, id, &self.query()))
			.unwrap_or_default()
	}

	pub fn get_material_id(&self, id: &sdf::Path) -> sdf::Path {
		if let Some(material) = self.value_cache.material_id(id) {
			return material;
		}
		self.resolve(id)
			.map(|(prim, adapter)| adapter.get_material_id(&prim, id))
			.unwrap_or_default()
	}

	pub fn get_material_resource(&self, id: &sdf::Path) -> Option<hd::MaterialNetwork> {
		if let Some(network) = self.value_cache.material_resource(id) {
			return Some(network);
		}
		let (prim, adapter) = self.resolve(id)?;
		adapter.get_material_resource(&prim, id, &self.query())
	}

	/// Render tag of `id`. Guides are hidden unless the delegate displays them.
	pub fn get_render_tag(&self, id: &sdf::Path) -> tf::Token {
		let Some((prim, adapter)) = self.resolve(id) else {
			return TOKENS.hidden.clone();
		};
		let tag = adapter.get_render_tag(&prim, id, None);
		if tag == usd_geom::TOKENS.guide && !self.config.display_guides {
			TOKENS.hidden.clone()
		} else {
			tag
		}
	}

	pub fn get_instance_indices(&self, instancer_id: &sdf::Path, prototype_id: &sdf::Path) -> Vec<i32> {
		self.resolve(instancer_id)
			.map(|(prim, adapter)| adapter.get_instance_indices(&prim, instancer_id, prototype_id, &self.query()))
			.unwrap_or_default()
	}

	pub fn get_instancer_id(&self, id: &sdf::Path) -> sdf::Path {
		self.resolve(id)
			.map(|(prim, adapter)| adapter.get_instancer_id(&prim, id))
			.unwrap_or_default()
	}

	pub fn get_instancer_prototypes(&self, instancer_id: &sdf::Path) -> Vec<sdf::Path> {
		self.resolve(instancer_id)
			.map(|(prim, adapter)| adapter.get_instancer_prototypes(&prim, instancer_id))
			.unwrap_or_default()
	}

	pub fn get_instancer_transform(&self, instancer_id: &sdf::Path) -> DMat4 {
		self.resolve(instancer_id)
			.map(|(prim, adapter)| adapter.get_instancer_transform(&prim, instancer_id, &self.query()))
			.unwrap_or(DMat4::IDENTITY)
	}

	/// Scene path of the prim drawn by `instance_index` of `id`.
	pub fn get_scene_prim_path(&self, id: &sdf::Path, instance_index: usize) -> sdf::Path {
		self.resolve(id)
			.map(|(prim, adapter)| adapter.get_scene_prim_path(&prim, id, instance_index))
			.unwrap_or_default()
	}

	pub fn sample_transform(&self, id: &sdf::Path, interval: (f64, f64), max_samples: usize) -> Vec<(f64, DMat4)> {
		self.resolve(id)
			.map(|(prim, adapter)| adapter.sample_transform(&prim, id, &self.query(), interval, max_samples))
			.unwrap_or_default()
	}

	pub fn sample_primvar(
		&self,
		id: &sdf::Path,
		key: &tf::Token,
		interval: (f64, f64),
		max_samples: usize,
	) -> Vec<(f64, vt::Value)> {
		self.resolve(id)
			.map(|(prim, adapter)| adapter.sample_primvar(&prim, id, key, &self.query(), interval, max_samples))
			.unwrap_or_default()
	}

	pub fn primvar_names(&self, id: &sdf::Path) -> Vec<tf::Token> {
		if let Some(names) = self.value_cache.primvar_names(id) {
			return names;
		}
		self.resolve(id)
			.map(|(prim, adapter)| adapter.primvar_names(&prim, id))
			.unwrap_or_default()
	}

	/// Dirty bits the delegate has accumulated for `id` since its last update.
	pub fn dirty_bits(&self, id: &sdf::Path) -> DirtyBits {
		self.book
			.prim_info
			.get(id)
			.map(|info| info.dirty_bits)
			.unwrap_or_default()
	}
}

impl<R: hd::RenderIndex> std::fmt::Debug for Delegate<R> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Delegate")
			.field("root", &self.root)
			.field("time", &self.time)
			.field("state", &self.state)
			.field("prims", &self.book.prim_info.len())
			.field("worker", &self.worker)
			.finish()
	}
}
