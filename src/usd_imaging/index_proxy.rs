use super::{AdapterRegistry, DelegateConfig, DependencyIndex, InstancerContext, PrimAdapter, PrimInfoTable, QueryContext, TOKENS};
use crate::hd::{self, DirtyBits};
use crate::{sdf, tf, usd, usd_geom};
use std::collections::BTreeSet;
use std::sync::Arc;

/// State the delegate keeps across synchronization passes.
#[derive(Debug, Default)]
pub(crate) struct Bookkeeping {
	pub prim_info: PrimInfoTable,
	pub dependencies: DependencyIndex,
	/// Cache paths whose variability must be tracked in the next variability pass.
	pub variability_requests: BTreeSet<sdf::Path>,
	/// Cache paths to pull in the next update pass regardless of their dirty bits.
	pub update_requests: BTreeSet<sdf::Path>,
	/// Cache paths with time-varying bits, rebuilt lazily by `set_time`.
	pub time_varying: Option<Vec<sdf::Path>>,
}

#[derive(Debug, Clone, PartialEq)]
enum Removal {
	Rprim(sdf::Path),
	Sprim(tf::Token, sdf::Path),
	Bprim(tf::Token, sdf::Path),
	Instancer(sdf::Path),
}

impl Removal {
	fn cache_path(&self) -> &sdf::Path {
		match self {
			Removal::Rprim(path) | Removal::Sprim(_, path) | Removal::Bprim(_, path) | Removal::Instancer(path) => path,
		}
	}
}

/// Mutation surface handed to adapters while populating and processing changes.
///
/// Insertions reach the render index immediately. Removals and
/// repopulation requests are queued and applied by the delegate between
/// phases, so an adapter never observes half-removed state.
pub struct IndexProxy<'a> {
	stage: &'a usd::Stage,
	registry: &'a AdapterRegistry,
	config: &'a DelegateConfig,
	query: QueryContext<'a>,
	render_index: &'a mut dyn hd::RenderIndex,
	book: &'a mut Bookkeeping,
	paths_to_repopulate: Vec<sdf::Path>,
	removals: Vec<Removal>,
}

impl<'a> IndexProxy<'a> {
	pub(crate) fn new(
		stage: &'a usd::Stage,
		registry: &'a AdapterRegistry,
		config: &'a DelegateConfig,
		query: QueryContext<'a>,
		render_index: &'a mut dyn hd::RenderIndex,
		book: &'a mut Bookkeeping,
	) -> Self {
		Self {
			stage,
			registry,
			config,
			query,
			render_index,
			book,
			paths_to_repopulate: Vec::new(),
			removals: Vec::new(),
		}
	}

	pub fn stage(&self) -> &'a usd::Stage {
		self.stage
	}

	pub fn query(&self) -> QueryContext<'a> {
		self.query
	}

	pub fn config(&self) -> &'a DelegateConfig {
		self.config
	}

	pub fn prim_info(&self) -> &PrimInfoTable {
		&self.book.prim_info
	}

	pub fn dependencies(&self) -> &DependencyIndex {
		&self.book.dependencies
	}

	/// Adapter for `prim`, honoring the delegate's material and light switches.
	pub fn adapter_for(&self, prim: &usd::Prim, ignore_instancing: bool) -> Option<Arc<dyn PrimAdapter>> {
		self.registry.configured_adapter_for(prim, ignore_instancing, self.config)
	}

	/// Adapter used to populate materials bound by gprims, if materials are enabled.
	pub fn material_adapter(&self) -> Option<Arc<dyn PrimAdapter>> {
		if !self.config.scene_materials_enabled {
			return None;
		}
		self.registry.adapter_for_type(&TOKENS.material).cloned()
	}

	pub fn instance_adapter(&self) -> Arc<dyn PrimAdapter> {
		self.registry.instance_adapter().clone()
	}

	/// The draw mode for `prim`, or `default` when draw modes are disabled.
	pub fn model_draw_mode(&self, prim: &usd::Prim) -> tf::Token {
		if self.config.draw_modes_enabled {
			usd_geom::compute_draw_mode(prim)
		} else {
			usd_geom::TOKENS.default_.clone()
		}
	}
}

/// Insertion.
impl IndexProxy<'_> {
	/// Insert an rprim for `prim`. When populated on behalf of an instancer,
	/// `prim` is the instancer prim and the instancer's adapter owns the entry.
	pub fn insert_rprim(
		&mut self,
		prim_type: &tf::Token,
		cache_path: &sdf::Path,
		prim: &usd::Prim,
		instancer_context: Option<&InstancerContext>,
	) {
		let instancer = instancer_context
			.map(|ctx| ctx.instancer_cache_path.clone())
			.unwrap_or_default();
		let Some(adapter) = self.owning_adapter(prim, instancer_context) else {
			return;
		};

		if !self.render_index.is_rprim_type_supported(prim_type) {
			log::debug!("Skipping <{cache_path}>: rprim type {prim_type} is not supported");
			return;
		}
		self.render_index.insert_rprim(prim_type, cache_path, &instancer);
		self.add_prim_info(cache_path, prim, adapter);
	}

	pub fn insert_sprim(
		&mut self,
		prim_type: &tf::Token,
		cache_path: &sdf::Path,
		prim: &usd::Prim,
		instancer_context: Option<&InstancerContext>,
	) {
		let Some(adapter) = self.owning_adapter(prim, instancer_context) else {
			return;
		};

		if !self.render_index.is_sprim_type_supported(prim_type) {
			log::debug!("Skipping <{cache_path}>: sprim type {prim_type} is not supported");
			return;
		}
		self.render_index.insert_sprim(prim_type, cache_path);
		self.add_prim_info(cache_path, prim, adapter);
	}

	pub fn insert_bprim(
		&mut self,
		prim_type: &tf::Token,
		cache_path: &sdf::Path,
		prim: &usd::Prim,
		instancer_context: Option<&InstancerContext>,
	) {
		let Some(adapter) = self.owning_adapter(prim, instancer_context) else {
			return;
		};
		self.render_index.insert_bprim(prim_type, cache_path);
		self.add_prim_info(cache_path, prim, adapter);
	}

	pub fn insert_instancer(
		&mut self,
		cache_path: &sdf::Path,
		prim: &usd::Prim,
		instancer_context: Option<&InstancerContext>,
	) {
		let parent = instancer_context
			.map(|ctx| ctx.instancer_cache_path.clone())
			.unwrap_or_default();
		let Some(adapter) = self.owning_adapter(prim, instancer_context) else {
			return;
		};
		self.render_index.insert_instancer(cache_path, &parent);
		self.add_prim_info(cache_path, prim, adapter);
	}

	fn owning_adapter(
		&self,
		prim: &usd::Prim,
		instancer_context: Option<&InstancerContext>,
	) -> Option<Arc<dyn PrimAdapter>> {
		let adapter = match instancer_context {
			Some(ctx) => ctx.instancer_adapter.clone(),
			None => self.adapter_for(prim, false),
		};
		if adapter.is_none() {
			super::diagnostic::coding_error!("No adapter owns <{}>", prim.path());
		}
		adapter
	}

	fn add_prim_info(&mut self, cache_path: &sdf::Path, prim: &usd::Prim, adapter: Arc<dyn PrimAdapter>) {
		if !self
			.book
			.prim_info
			.insert(cache_path.clone(), prim.path().clone(), adapter)
		{
			super::diagnostic::coding_error!("<{cache_path}> was populated twice");
		}
		self.book.dependencies.add(prim.path(), cache_path);
		self.book.variability_requests.insert(cache_path.clone());
		self.book.time_varying = None;
	}
}

/// Dependencies and population state.
impl IndexProxy<'_> {
	/// Record that `cache_path` must be refreshed when `prim` changes.
	pub fn add_dependency(&mut self, cache_path: &sdf::Path, prim: &usd::Prim) {
		self.book.dependencies.add(prim.path(), cache_path);
	}

	/// Drop the edge from the prim `cache_path` was inserted for.
	pub fn remove_prim_info_dependency(&mut self, cache_path: &sdf::Path) {
		let Some(info) = self.book.prim_info.get(cache_path) else {
			return;
		};
		let usd_path = info.usd_path.clone();
		self.book.dependencies.remove(&usd_path, cache_path);
	}

	pub fn is_populated(&self, cache_path: &sdf::Path) -> bool {
		self.book.prim_info.contains(cache_path)
	}

	/// Queue the scene subtree at `usd_path` for population after change processing.
	pub fn repopulate(&mut self, usd_path: &sdf::Path) {
		self.paths_to_repopulate.push(usd_path.prim_path());
	}

	/// Resync every other cache path depending on `usd_path`.
	pub fn resync_dependents(&mut self, usd_path: &sdf::Path) {
		let dependents: Vec<sdf::Path> = self
			.book
			.dependencies
			.equal_range(usd_path)
			.filter(|cache_path| *cache_path != usd_path)
			.cloned()
			.collect();

		for cache_path in dependents {
			let Some(adapter) = self.book.prim_info.get(&cache_path).map(|info| info.adapter.clone()) else {
				continue;
			};
			log::debug!(target: "usd_imaging::changes", "Resyncing <{cache_path}> depending on <{usd_path}>");
			adapter.process_prim_resync(&cache_path, self);
		}
	}

	pub fn request_track_variability(&mut self, cache_path: &sdf::Path) {
		self.book.variability_requests.insert(cache_path.clone());
	}

	pub fn request_update_for_time(&mut self, cache_path: &sdf::Path) {
		self.book.update_requests.insert(cache_path.clone());
	}

	pub fn invalidate_time_varying_cache(&mut self) {
		self.book.time_varying = None;
	}

	/// Re-run variability tracking for `cache_path` right away and return
	/// its new time-varying bits.
	pub(crate) fn retrack_variability(&mut self, prim: &usd::Prim, cache_path: &sdf::Path) -> DirtyBits {
		let Some(adapter) = self.book.prim_info.get(cache_path).map(|info| info.adapter.clone()) else {
			return DirtyBits::CLEAN;
		};
		let mut bits = DirtyBits::CLEAN;
		adapter.track_variability(prim, cache_path, &self.query, &mut bits);
		if let Some(info) = self.book.prim_info.get_mut(cache_path) {
			info.time_varying_bits = bits;
		}
		self.book.time_varying = None;
		bits
	}

	/// Repopulation roots with duplicates and nested paths collapsed into
	/// their shortest prefix.
	pub(crate) fn take_paths_to_repopulate(&mut self) -> Vec<sdf::Path> {
		let mut paths = std::mem::take(&mut self.paths_to_repopulate);
		paths.sort();
		let mut unique: Vec<sdf::Path> = Vec::with_capacity(paths.len());
		for path in paths {
			if !unique.last().is_some_and(|root| path.has_prefix(root)) {
				unique.push(path);
			}
		}
		unique
	}
}

/// Removal.
impl IndexProxy<'_> {
	pub fn remove_rprim(&mut self, cache_path: &sdf::Path) {
		self.removals.push(Removal::Rprim(cache_path.clone()));
	}

	pub fn remove_sprim(&mut self, prim_type: &tf::Token, cache_path: &sdf::Path) {
		self.removals.push(Removal::Sprim(prim_type.clone(), cache_path.clone()));
	}

	pub fn remove_bprim(&mut self, prim_type: &tf::Token, cache_path: &sdf::Path) {
		self.removals.push(Removal::Bprim(prim_type.clone(), cache_path.clone()));
	}

	pub fn remove_instancer(&mut self, cache_path: &sdf::Path) {
		self.removals.push(Removal::Instancer(cache_path.clone()));
	}

	/// Apply queued removals to the render index, the prim info table and
	/// the dependency index.
	pub(crate) fn process_removals(&mut self) {
		for removal in std::mem::take(&mut self.removals) {
			let cache_path = removal.cache_path();
			if self.book.prim_info.remove(cache_path).is_none() {
				continue;
			}
			log::debug!(target: "usd_imaging::changes", "Removing {removal:?}");

			self.book.dependencies.remove_cache_path(cache_path);
			self.book.variability_requests.remove(cache_path);
			self.book.update_requests.remove(cache_path);
			self.book.time_varying = None;

			match &removal {
				Removal::Rprim(path) => self.render_index.remove_rprim(path),
				Removal::Sprim(prim_type, path) => self.render_index.remove_sprim(prim_type, path),
				Removal::Bprim(prim_type, path) => self.render_index.remove_bprim(prim_type, path),
				Removal::Instancer(path) => self.render_index.remove_instancer(path),
			}
		}
	}
}

/// Dirty marking.
impl IndexProxy<'_> {
	fn accumulate_dirty(&mut self, cache_path: &sdf::Path, bits: DirtyBits) -> bool {
		match self.book.prim_info.get_mut(cache_path) {
			Some(info) => {
				info.dirty_bits |= bits;
				true
			}
			None => {
				log::debug!("Ignoring dirty bits for unpopulated <{cache_path}>");
				false
			}
		}
	}

	pub fn mark_rprim_dirty(&mut self, cache_path: &sdf::Path, bits: DirtyBits) {
		if self.accumulate_dirty(cache_path, bits) {
			self.render_index.mark_rprim_dirty(cache_path, bits);
		}
	}

	pub fn mark_sprim_dirty(&mut self, cache_path: &sdf::Path, bits: DirtyBits) {
		if self.accumulate_dirty(cache_path, bits) {
			self.render_index.mark_sprim_dirty(cache_path, bits);
		}
	}

	pub fn mark_bprim_dirty(&mut self, cache_path: &sdf::Path, bits: DirtyBits) {
		if self.accumulate_dirty(cache_path, bits) {
			self.render_index.mark_bprim_dirty(cache_path, bits);
		}
	}

	pub fn mark_instancer_dirty(&mut self, cache_path: &sdf::Path, bits: DirtyBits) {
		if self.accumulate_dirty(cache_path, bits) {
			self.render_index.mark_instancer_dirty(cache_path, bits);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hd::{MemoryRenderIndex, PrimKind};
	use crate::usd_imaging::GprimAdapter;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	#[test]
	fn removals_are_deferred_and_deduplicated() {
		let stage = usd::Stage::new();
		stage.define_prim("/World/Mesh", "Mesh").unwrap();
		let registry = AdapterRegistry::with_builtin();
		let config = DelegateConfig::default();
		let mut render_index = MemoryRenderIndex::new();
		let mut book = Bookkeeping::default();

		let mut index = IndexProxy::new(
			&stage,
			&registry,
			&config,
			QueryContext::new(usd::TimeCode::DEFAULT, &[]),
			&mut render_index,
			&mut book,
		);
		let mesh = stage.prim_at_path("/World/Mesh").unwrap();
		let cache_path = GprimAdapter::new().populate(&mesh, &mut index, None);
		assert_eq!(cache_path, p("/World/Mesh"));
		assert!(index.is_populated(&cache_path));

		index.remove_rprim(&cache_path);
		index.remove_rprim(&cache_path);
		assert!(index.is_populated(&cache_path));
		index.process_removals();
		assert!(!index.is_populated(&cache_path));
		assert!(index.dependencies().is_empty());
		drop(index);

		assert!(!render_index.contains(PrimKind::Rprim, &cache_path));
		assert_eq!(render_index.remove_count(), 1);
	}

	#[test]
	fn repopulation_collapses_nested_paths() {
		let stage = usd::Stage::new();
		let registry = AdapterRegistry::with_builtin();
		let config = DelegateConfig::default();
		let mut render_index = MemoryRenderIndex::new();
		let mut book = Bookkeeping::default();
		let mut index = IndexProxy::new(
			&stage,
			&registry,
			&config,
			QueryContext::new(usd::TimeCode::DEFAULT, &[]),
			&mut render_index,
			&mut book,
		);

		index.repopulate(&p("/World/A/Mesh"));
		index.repopulate(&p("/World/B"));
		index.repopulate(&p("/World/A"));
		index.repopulate(&p("/World/A.proto_Mesh_id0"));
		assert_eq!(index.take_paths_to_repopulate(), vec![p("/World/A"), p("/World/B")]);
		assert!(index.take_paths_to_repopulate().is_empty());
	}
}
