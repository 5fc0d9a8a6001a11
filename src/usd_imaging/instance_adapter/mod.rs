//! Resolution of native instances into renderer instancers.
//!
//! Instances sharing a prototype are bucketed by the state they pass on to
//! it: bound material, draw mode, purpose and inherited constant primvars.
//! Each bucket becomes one renderer instancer named after the instance that
//! created it, and the prototype is walked once per bucket. Prototype prims
//! are populated by their own adapters below cache paths of the form
//! `<instancer>.proto_<name>_id<n>`; this adapter owns those cache paths and
//! forwards their queries to the prototype prim's adapter.

mod contexts;
mod record;

pub use contexts::InstanceContexts;

use self::contexts::path_from_chain;
use self::record::{BucketKey, DrawCache, InstancerArena, InstancerRecord, ProtoPrim, Visibility};
use super::diagnostic::coding_error;
use super::population::{should_cull_subtree, traverse};
use super::{
	IndexProxy, InstancerContext, PrimAdapter, QueryContext, ValueCache, is_ignored_prim_field, material_usd_path,
	primvar_property_change, sample_at_times,
};
use crate::hd::{self, DirtyBits};
use crate::{sdf, tf, usd, usd_geom, vt};
use glam::DMat4;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Adapter for instance prims and the prototype prims drawn through them.
#[derive(Default)]
pub struct InstanceAdapter {
	arena: RwLock<InstancerArena>,
	visibility_evaluations: AtomicUsize,
}

impl std::fmt::Debug for InstanceAdapter {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("InstanceAdapter")
			.field("instancers", &self.arena.read().records.len())
			.finish()
	}
}

/// Prototype cache paths are property paths below their instancer.
fn is_child(cache_path: &sdf::Path) -> bool {
	cache_path.is_property_path()
}

/// Scene path of `path` seen through `parent_proxy` when it lies inside a
/// prototype.
fn proxy_path(prim: &usd::Prim, parent_proxy: Option<&sdf::Path>) -> sdf::Path {
	match parent_proxy {
		Some(parent) if prim.is_in_prototype() => path_from_chain(&[prim.path().clone(), parent.clone()]),
		_ => prim.path().clone(),
	}
}

/// `(name, type)` of the constant primvars `prim` authors or inherits.
fn inherited_primvar_specs(prim: &usd::Prim) -> Vec<(tf::Token, tf::Token)> {
	let api = usd_geom::PrimvarsApi::new(prim);
	let mut specs: Vec<(tf::Token, tf::Token)> = api
		.primvars()
		.into_iter()
		.filter(|primvar| primvar.is_inheritable())
		.chain(api.find_inheritable_primvars())
		.map(|primvar| (primvar.primvar_name(), primvar.type_name()))
		.collect();
	specs.sort();
	specs.dedup_by(|a, b| a.0 == b.0);
	specs
}

fn context_prims<'a>(stage: &'a usd::Stage, context: &[sdf::Path]) -> Vec<usd::Prim<'a>> {
	context.iter().filter_map(|path| stage.prim_at_path(path)).collect()
}

/// World transform of the instance drawn through `context`, innermost first.
fn context_transform(stage: &usd::Stage, context: &[sdf::Path], time: usd::TimeCode) -> DMat4 {
	context_prims(stage, context)
		.iter()
		.fold(DMat4::IDENTITY, |inner, prim| usd_geom::compute_local_to_world(prim, time) * inner)
}

impl InstanceAdapter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Paths of every instancer populated so far.
	pub fn instancers(&self) -> Vec<sdf::Path> {
		self.arena.read().records.keys().cloned().collect()
	}

	/// Run `f` over the draw contexts of `instancer`.
	pub fn instance_contexts<R>(
		&self,
		stage: &usd::Stage,
		instancer: &sdf::Path,
		f: impl FnOnce(InstanceContexts) -> R,
	) -> R {
		let arena = self.arena.read();
		f(InstanceContexts::new(&arena, stage, instancer))
	}

	/// Number of instances `instancer` draws, counting every expansion of
	/// nested instances.
	pub fn instance_count(&self, stage: &usd::Stage, instancer: &sdf::Path) -> usize {
		let arena = self.arena.read();
		let Some(record) = arena.records.get(instancer) else {
			return 0;
		};
		let mut cache = record.cache.lock();
		*cache
			.num_instances
			.get_or_insert_with(|| arena.count_instances(stage, instancer))
	}

	/// Number of times instance visibility was evaluated from the scene.
	pub fn visibility_evaluations(&self) -> usize {
		self.visibility_evaluations.load(Ordering::Relaxed)
	}

	fn proto_prim(&self, cache_path: &sdf::Path) -> Option<ProtoPrim> {
		let arena = self.arena.read();
		let proto = arena
			.records
			.get(&cache_path.prim_path())
			.and_then(|record| record.prim_map.get(cache_path))
			.cloned();
		if proto.is_none() {
			log::debug!(target: "usd_imaging::instancer", "No prototype prim for <{cache_path}>");
		}
		proto
	}

	/// Call `f` with the prototype prim behind `cache_path` and its adapter.
	fn with_proto<R>(
		&self,
		stage: &usd::Stage,
		cache_path: &sdf::Path,
		f: impl FnOnce(&usd::Prim, &dyn PrimAdapter) -> R,
	) -> Option<R> {
		let proto = self.proto_prim(cache_path)?;
		let prim = stage.prim_at_path(&proto.path)?;
		Some(f(&prim, proto.adapter.as_ref()))
	}

	/// Purpose shared by the instances of the bucket drawing `cache_path`.
	fn bucket_purpose(&self, cache_path: &sdf::Path) -> Option<tf::Token> {
		self.arena
			.read()
			.records
			.get(&cache_path.prim_path())
			.map(|record| record.key.purpose.clone())
	}

	/// Material of a prototype prim, falling back to the instancer's.
	fn proto_material(&self, stage: &usd::Stage, cache_path: &sdf::Path) -> sdf::Path {
		let material = self
			.with_proto(stage, cache_path, |prim, adapter| adapter.get_material_id(prim, cache_path))
			.unwrap_or_default();
		if !material.is_empty() {
			return material;
		}
		self.arena
			.read()
			.records
			.get(&cache_path.prim_path())
			.map(|record| record.key.material.clone())
			.unwrap_or_default()
	}
}

/// Population.
impl InstanceAdapter {
	fn bucket_key(index: &IndexProxy, instance: &usd::Prim, proxy: &usd::Prim) -> BucketKey {
		BucketKey {
			material: material_usd_path(instance),
			draw_mode: index.model_draw_mode(proxy),
			purpose: usd_geom::compute_purpose(proxy),
			inherited_primvars: inherited_primvar_specs(proxy),
		}
	}

	/// Add `instance` to an instancer, creating and populating the instancer
	/// if no existing bucket matches. `parent_proxy` is the scene path of the
	/// enclosing instancer for instances nested in a prototype.
	fn populate_instance(
		&self,
		instance: &usd::Prim,
		index: &mut IndexProxy,
		parent_proxy: Option<&sdf::Path>,
	) -> sdf::Path {
		let stage = index.stage();
		let instance_path = instance.path().clone();
		let Some(prototype) = instance.prototype() else {
			coding_error!("Instance <{instance_path}> has no prototype");
			return sdf::Path::empty_path();
		};
		let prototype_path = prototype.path().clone();

		let instance_proxy_path = proxy_path(instance, parent_proxy);
		let Some(instance_proxy) = stage.prim_at_path(&instance_proxy_path) else {
			coding_error!("No prim at instance proxy path <{instance_proxy_path}>");
			return sdf::Path::empty_path();
		};
		let key = Self::bucket_key(index, instance, &instance_proxy);

		// A nested instance reached again through an outer instance in
		// another bucket keeps the instancer it already created.
		let existing = {
			let arena = self.arena.read();
			arena
				.find_bucket(&prototype_path, &key)
				.or_else(|| arena.records.contains_key(&instance_path).then(|| instance_path.clone()))
		};
		let instancer_path = existing.clone().unwrap_or_else(|| instance_path.clone());
		let Some(instancer_prim) = stage.prim_at_path(&instancer_path) else {
			coding_error!("Instancer <{instancer_path}> has no prim");
			return sdf::Path::empty_path();
		};
		let instancer_proxy_path = proxy_path(&instancer_prim, parent_proxy);

		let mut nested = Vec::new();
		if existing.is_none() {
			log::trace!(
				target: "usd_imaging::instancer",
				"[Add Instancer] <{instancer_path}> for prototype <{prototype_path}>, key {key:?}"
			);
			let mut record = InstancerRecord::new(prototype_path.clone(), key);
			record.prim_map =
				self.populate_prototype(index, &prototype, &instancer_prim, &instancer_proxy_path, &record.key, &mut nested);
			record.nested_instances = nested.clone();

			index.insert_instancer(&instancer_path, &instancer_prim, None);
			index.add_dependency(&instancer_path, &prototype);

			let mut arena = self.arena.write();
			arena.records.insert(instancer_path.clone(), record);
			arena
				.prototype_to_instancers
				.entry(prototype_path.clone())
				.or_default()
				.push(instancer_path.clone());
		}

		{
			let mut arena = self.arena.write();
			let arena = &mut *arena;
			if let Some(record) = arena.records.get_mut(&instancer_path)
				&& record.instances.insert(instance_path.clone())
			{
				arena
					.instance_to_instancer
					.insert(instance_path.clone(), instancer_path.clone());
				if let Some(parent) = parent_proxy.and_then(|parent| stage.prim_at_path(parent)) {
					record.parent_instances.insert(parent.prim_in_prototype().path().clone());
				}
				log::trace!(target: "usd_imaging::instancer", "[Add Instance] <{instancer_path}> <- <{instance_path}>");
			}
		}

		for nested_path in &nested {
			match stage.prim_at_path(nested_path) {
				Some(nested_prim) => {
					self.populate_instance(&nested_prim, index, Some(&instancer_proxy_path));
				}
				None => coding_error!("Nested instance <{nested_path}> vanished during population"),
			}
		}

		self.refresh_dependent_instancers(index, instance);
		instancer_path
	}

	/// Walk the prototype once, populating every imageable prim on behalf
	/// of the instancer. Instances met on the way are collected in `nested`.
	fn populate_prototype(
		&self,
		index: &mut IndexProxy,
		prototype: &usd::Prim,
		instancer_prim: &usd::Prim,
		instancer_proxy_path: &sdf::Path,
		key: &BucketKey,
		nested: &mut Vec<sdf::Path>,
	) -> BTreeMap<sdf::Path, ProtoPrim> {
		let stage = index.stage();
		let instancer_path = instancer_prim.path().clone();
		let instance_adapter = index.instance_adapter();
		let mut prim_map = BTreeMap::new();
		let mut proto_id = 0usize;

		traverse(prototype.clone(), false, |prim| {
			let is_root = prim.path() == prototype.path();
			if !is_root && prim.is_instance() {
				nested.push(prim.path().clone());
				return false;
			}
			let Some(proxy) = stage.prim_at_path(path_from_chain(&[prim.path().clone(), instancer_proxy_path.clone()]))
			else {
				return true;
			};
			if should_cull_subtree(&proxy) {
				return false;
			}
			let Some(adapter) = index.adapter_for(prim, true) else {
				return true;
			};
			if is_root && !adapter.can_populate_usd_instance() {
				coding_error!(
					"Gprim <{}> is instanced directly; put it under an Xform and instance the Xform instead",
					instancer_prim.path()
				);
				return true;
			}

			let child_name = tf::Token::new(format!("proto_{}_id{proto_id}", prim.name()));
			proto_id += 1;
			let mut material = adapter.get_material_id(prim, prim.path());
			if material.is_empty() {
				material = key.material.clone();
			}
			let ctx = InstancerContext {
				instancer_cache_path: instancer_path.clone(),
				child_name,
				instancer_material_usd_path: material,
				instancer_adapter: Some(instance_adapter.clone()),
			};

			let populated = if is_root { instancer_prim } else { prim };
			let proto_path = adapter.populate(populated, index, Some(&ctx));
			if !proto_path.is_empty() {
				log::trace!(
					target: "usd_imaging::instancer",
					"[Add Prototype] <{proto_path}> for <{}>",
					populated.path()
				);
				prim_map.insert(
					proto_path,
					ProtoPrim {
						path: populated.path().clone(),
						adapter: adapter.clone(),
					},
				);
			}
			!adapter.should_cull_children()
		});

		prim_map
	}

	/// Every instancer whose draw set includes `instance` now draws more
	/// instances: invalidate its caches and schedule it for update.
	fn refresh_dependent_instancers(&self, index: &mut IndexProxy, instance: &usd::Prim) {
		let dependents = self.arena.read().dependent_instancers(instance.path());
		for instancer in dependents {
			if !index.is_populated(&instancer) {
				continue;
			}
			if &instancer != instance.path() {
				index.add_dependency(&instancer, instance);
			}
			index.mark_instancer_dirty(&instancer, DirtyBits::PRIMVAR | DirtyBits::INSTANCE_INDEX);

			let queued = {
				let arena = self.arena.read();
				let Some(record) = arena.records.get(&instancer) else {
					continue;
				};
				let mut cache = record.cache.lock();
				cache.reset();
				std::mem::replace(&mut cache.refresh, true)
			};
			if !queued {
				index.request_track_variability(&instancer);
				index.request_update_for_time(&instancer);
			}
		}
	}

	/// Unload every instancer connected to the instance at `cache_path`,
	/// optionally queueing its instances for repopulation.
	fn resync_path(&self, cache_path: &sdf::Path, index: &mut IndexProxy, reload: bool) {
		let instance = cache_path.prim_path();
		let unloaded: Vec<(sdf::Path, InstancerRecord)> = {
			let mut arena = self.arena.write();
			arena
				.connected_instancers(&instance)
				.into_iter()
				.filter_map(|instancer| arena.remove(&instancer).map(|record| (instancer, record)))
				.collect()
		};

		let stage = index.stage();
		for (instancer, record) in unloaded {
			log::trace!(target: "usd_imaging::instancer", "[Unload Instancer] <{instancer}> reload: {reload}");
			for (proto_path, proto) in &record.prim_map {
				proto.adapter.process_prim_removal(proto_path, index);
			}
			if index.is_populated(&instancer) {
				index.remove_instancer(&instancer);
			}
			if !reload {
				continue;
			}
			for instance in &record.instances {
				if stage
					.prim_at_path(instance)
					.is_some_and(|prim| prim.is_active() && !prim.is_in_prototype())
				{
					index.repopulate(instance);
				}
			}
		}
	}
}

/// Per-instance values.
impl InstanceAdapter {
	fn evaluate_visibility(&self, stage: &usd::Stage, context: &[sdf::Path], time: usd::TimeCode) -> bool {
		self.visibility_evaluations.fetch_add(1, Ordering::Relaxed);
		context_prims(stage, context)
			.iter()
			.all(|prim| usd_geom::compute_visibility(prim, time))
	}

	fn classify_visibility(&self, stage: &usd::Stage, context: &[sdf::Path]) -> Visibility {
		let varying = context_prims(stage, context)
			.iter()
			.any(usd_geom::visibility_might_be_time_varying);
		if varying {
			self.visibility_evaluations.fetch_add(1, Ordering::Relaxed);
			Visibility::Varying
		} else if self.evaluate_visibility(stage, context, usd::TimeCode::DEFAULT) {
			Visibility::Visible
		} else {
			Visibility::Invisible
		}
	}

	/// Classify every `Unknown` instance of `instancer`.
	fn update_visibility(&self, arena: &InstancerArena, stage: &usd::Stage, instancer: &sdf::Path, cache: &mut DrawCache) {
		let count = *cache
			.num_instances
			.get_or_insert_with(|| arena.count_instances(stage, instancer));
		if cache.visibility.len() != count {
			cache.visibility = vec![Visibility::Unknown; count];
		}
		if !cache.visibility.contains(&Visibility::Unknown) {
			return;
		}
		for (context, index) in InstanceContexts::new(arena, stage, instancer) {
			if let Some(slot) = cache.visibility.get_mut(index)
				&& *slot == Visibility::Unknown
			{
				*slot = self.classify_visibility(stage, &context);
			}
		}
	}

	/// Forget the classification of every instance whose context contains
	/// `changed` or a prim below it.
	fn invalidate_visibility(&self, stage: &usd::Stage, instancer: &sdf::Path, changed: &sdf::Path) {
		let arena = self.arena.read();
		let Some(record) = arena.records.get(instancer) else {
			return;
		};
		let mut cache = record.cache.lock();
		if cache.visibility.is_empty() {
			return;
		}
		for (context, index) in InstanceContexts::new(&arena, stage, instancer) {
			if context.iter().any(|path| path.has_prefix(changed))
				&& let Some(slot) = cache.visibility.get_mut(index)
			{
				*slot = Visibility::Unknown;
			}
		}
	}

	fn instance_transforms(&self, stage: &usd::Stage, instancer: &sdf::Path, time: usd::TimeCode) -> Vec<DMat4> {
		self.instance_contexts(stage, instancer, |contexts| {
			contexts
				.map(|(context, _)| context_transform(stage, &context, time))
				.collect()
		})
	}

	/// One value per instance of the inherited primvar `name`, or `None`
	/// if no instance carries it.
	fn inherited_primvar_values(
		&self,
		stage: &usd::Stage,
		instancer: &sdf::Path,
		name: &tf::Token,
		time: usd::TimeCode,
	) -> Option<vt::Value> {
		let values: Vec<Option<vt::Value>> = self.instance_contexts(stage, instancer, |contexts| {
			contexts
				.map(|(context, _)| {
					let proxy = stage.prim_at_path(path_from_chain(&context))?;
					usd_geom::PrimvarsApi::new(&proxy)
						.find_primvar_with_inheritance(name)
						.and_then(|primvar| primvar.get(time))
				})
				.collect()
		});
		vt::Value::gather_elements(&values)
	}

	fn inherited_primvar_names(&self, instancer: &sdf::Path) -> Vec<tf::Token> {
		self.arena
			.read()
			.records
			.get(instancer)
			.map(|record| {
				record
					.key
					.inherited_primvars
					.iter()
					.map(|(name, _)| name.clone())
					.collect()
			})
			.unwrap_or_default()
	}

	fn is_inherited_primvar(&self, instancer: &sdf::Path, key: &tf::Token) -> bool {
		let name = key.strip_prefix("primvars:").unwrap_or_else(|| key.clone());
		self.inherited_primvar_names(instancer).contains(&name)
	}
}

impl PrimAdapter for InstanceAdapter {
	fn name(&self) -> &'static str {
		"instance"
	}

	fn populate(
		&self,
		prim: &usd::Prim,
		index: &mut IndexProxy,
		_instancer_context: Option<&InstancerContext>,
	) -> sdf::Path {
		self.populate_instance(prim, index, None)
	}

	fn should_cull_children(&self) -> bool {
		true
	}

	fn is_instancer_adapter(&self) -> bool {
		true
	}

	fn track_variability(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		query: &QueryContext,
		time_varying_bits: &mut DirtyBits,
	) {
		let stage = prim.stage();
		if is_child(cache_path) {
			self.with_proto(stage, cache_path, |proto, adapter| {
				adapter.track_variability(proto, cache_path, query, time_varying_bits)
			});
			return;
		}

		let arena = self.arena.read();
		let Some(record) = arena.records.get(cache_path) else {
			return;
		};
		let contexts = InstanceContexts::new(&arena, stage, cache_path);

		let transform_varying = contexts.clone().any(|(context, _)| {
			context_prims(stage, &context)
				.iter()
				.any(usd_geom::transform_might_be_time_varying)
		});
		let primvars_varying = !record.key.inherited_primvars.is_empty()
			&& contexts.clone().any(|(context, _)| {
				let Some(proxy) = stage.prim_at_path(path_from_chain(&context)) else {
					return false;
				};
				let api = usd_geom::PrimvarsApi::new(&proxy);
				record.key.inherited_primvars.iter().any(|(name, _)| {
					api.find_primvar_with_inheritance(name)
						.is_some_and(|primvar| primvar.attr.might_be_time_varying())
				})
			});
		if transform_varying || primvars_varying {
			*time_varying_bits |= DirtyBits::PRIMVAR;
		}

		let mut cache = record.cache.lock();
		self.update_visibility(&arena, stage, cache_path, &mut cache);
		if cache.visibility.contains(&Visibility::Varying) {
			*time_varying_bits |= DirtyBits::INSTANCE_INDEX;
		}
		cache.refresh = false;
	}

	fn update_for_time(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		query: &QueryContext,
		requested_bits: DirtyBits,
		cache: &ValueCache,
	) {
		let stage = prim.stage();
		if is_child(cache_path) {
			self.with_proto(stage, cache_path, |proto, adapter| {
				adapter.update_for_time(proto, cache_path, query, requested_bits, cache)
			});
			if requested_bits.contains(DirtyBits::MATERIAL_ID) {
				cache.set_material_id(cache_path, self.proto_material(stage, cache_path));
			}
			if requested_bits.contains(DirtyBits::RENDER_TAG) {
				let tag = self.get_render_tag(prim, cache_path, None);
				cache.set_value(cache_path, &hd::TOKENS.render_tag, tag.into());
			}
			return;
		}

		if requested_bits.contains(DirtyBits::TRANSFORM) {
			cache.set_transform(cache_path, DMat4::IDENTITY);
		}
		if requested_bits.contains(DirtyBits::PRIMVAR) {
			let transforms = self.instance_transforms(stage, cache_path, query.time);
			cache.set_value(cache_path, &hd::TOKENS.instance_transform, vt::Value::from(transforms));

			let names = self.inherited_primvar_names(cache_path);
			for name in &names {
				if let Some(values) = self.inherited_primvar_values(stage, cache_path, name, query.time) {
					cache.set_value(cache_path, name, values);
				}
			}
			cache.merge_primvar_names(
				cache_path,
				std::iter::once(hd::TOKENS.instance_transform.clone()).chain(names),
			);
		}
	}

	fn process_property_change(&self, prim: &usd::Prim, cache_path: &sdf::Path, property_path: &sdf::Path) -> DirtyBits {
		let stage = prim.stage();
		if is_child(cache_path) {
			return self
				.with_proto(stage, cache_path, |proto, adapter| {
					adapter.process_property_change(proto, cache_path, property_path)
				})
				.unwrap_or(DirtyBits::CLEAN);
		}

		let name = property_path.name_token();
		if name == usd_geom::TOKENS.purpose {
			DirtyBits::ALL_DIRTY
		} else if usd_geom::XformOp::is_transformation_affected_by_attr_named(&name) {
			DirtyBits::PRIMVAR
		} else if name == usd_geom::TOKENS.visibility {
			self.invalidate_visibility(stage, cache_path, &property_path.prim_path());
			DirtyBits::INSTANCE_INDEX
		} else {
			primvar_property_change(&name)
		}
	}

	fn process_prim_change(&self, prim: &usd::Prim, cache_path: &sdf::Path, changed_fields: &[tf::Token]) -> DirtyBits {
		if is_child(cache_path) {
			return self
				.with_proto(prim.stage(), cache_path, |proto, adapter| {
					adapter.process_prim_change(proto, cache_path, changed_fields)
				})
				.unwrap_or(DirtyBits::CLEAN);
		}
		if changed_fields.iter().all(is_ignored_prim_field) {
			DirtyBits::CLEAN
		} else {
			DirtyBits::ALL_DIRTY
		}
	}

	fn process_prim_resync(&self, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.resync_path(cache_path, index, true);
	}

	fn process_prim_removal(&self, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.resync_path(cache_path, index, false);
	}

	fn remove_prim(&self, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.resync_path(cache_path, index, false);
	}

	fn mark_dirty(&self, _prim: &usd::Prim, cache_path: &sdf::Path, dirty: DirtyBits, index: &mut IndexProxy) {
		if !is_child(cache_path) {
			index.mark_instancer_dirty(cache_path, dirty);
			return;
		}
		let Some(proto) = self.proto_prim(cache_path) else {
			return;
		};
		let stage = index.stage();
		if let Some(proto_prim) = stage.prim_at_path(&proto.path) {
			proto.adapter.mark_dirty(&proto_prim, cache_path, dirty, index);
		}
	}

	fn mark_transform_dirty(&self, prim: &usd::Prim, cache_path: &sdf::Path, index: &mut IndexProxy) {
		if !is_child(cache_path) {
			index.mark_instancer_dirty(cache_path, DirtyBits::PRIMVAR | DirtyBits::TRANSFORM);
			return;
		}
		if let Some(proto) = self.proto_prim(cache_path)
			&& let Some(proto_prim) = index.stage().prim_at_path(&proto.path)
		{
			proto.adapter.mark_transform_dirty(&proto_prim, cache_path, index);
		} else {
			log::debug!("Cannot mark transform of <{}> dirty", prim.path());
		}
	}

	fn mark_visibility_dirty(&self, _prim: &usd::Prim, cache_path: &sdf::Path, index: &mut IndexProxy) {
		if !is_child(cache_path) {
			index.mark_instancer_dirty(cache_path, DirtyBits::VISIBILITY | DirtyBits::INSTANCE_INDEX);
			return;
		}
		if let Some(proto) = self.proto_prim(cache_path)
			&& let Some(proto_prim) = index.stage().prim_at_path(&proto.path)
		{
			proto.adapter.mark_visibility_dirty(&proto_prim, cache_path, index);
		}
	}

	fn mark_material_dirty(&self, _prim: &usd::Prim, cache_path: &sdf::Path, index: &mut IndexProxy) {
		if !is_child(cache_path) {
			return;
		}
		if let Some(proto) = self.proto_prim(cache_path)
			&& let Some(proto_prim) = index.stage().prim_at_path(&proto.path)
		{
			proto.adapter.mark_material_dirty(&proto_prim, cache_path, index);
		}
	}

	fn get_transform(&self, prim: &usd::Prim, cache_path: &sdf::Path, query: &QueryContext) -> DMat4 {
		if !is_child(cache_path) {
			return DMat4::IDENTITY;
		}
		self.with_proto(prim.stage(), cache_path, |proto, adapter| {
			adapter.get_transform(proto, cache_path, query)
		})
		.unwrap_or(DMat4::IDENTITY)
	}

	fn get_visible(&self, prim: &usd::Prim, cache_path: &sdf::Path, query: &QueryContext) -> bool {
		if !is_child(cache_path) {
			return !query.is_invised(prim.path()) && usd_geom::compute_visibility(prim, query.time);
		}
		self.with_proto(prim.stage(), cache_path, |proto, adapter| {
			adapter.get_visible(proto, cache_path, query)
		})
		.unwrap_or(false)
	}

	fn get(&self, prim: &usd::Prim, cache_path: &sdf::Path, key: &tf::Token, query: &QueryContext) -> Option<vt::Value> {
		let stage = prim.stage();
		if is_child(cache_path) {
			return self
				.with_proto(stage, cache_path, |proto, adapter| adapter.get(proto, cache_path, key, query))
				.flatten();
		}
		if *key == hd::TOKENS.instance_transform {
			return Some(vt::Value::from(self.instance_transforms(stage, cache_path, query.time)));
		}
		if self.is_inherited_primvar(cache_path, key) {
			return self.inherited_primvar_values(stage, cache_path, key, query.time);
		}
		prim.attribute(key).get(query.time)
	}

	fn get_topology(&self, prim: &usd::Prim, cache_path: &sdf::Path, query: &QueryContext) -> Option<hd::Topology> {
		if !is_child(cache_path) {
			return None;
		}
		self.with_proto(prim.stage(), cache_path, |proto, adapter| {
			adapter.get_topology(proto, cache_path, query)
		})
		.flatten()
	}

	fn get_extent(&self, prim: &usd::Prim, cache_path: &sdf::Path, query: &QueryContext) -> hd::Range3d {
		if !is_child(cache_path) {
			return hd::Range3d::default();
		}
		self.with_proto(prim.stage(), cache_path, |proto, adapter| {
			adapter.get_extent(proto, cache_path, query)
		})
		.unwrap_or_default()
	}

	fn get_material_id(&self, prim: &usd::Prim, cache_path: &sdf::Path) -> sdf::Path {
		if !is_child(cache_path) {
			return sdf::Path::empty_path();
		}
		self.proto_material(prim.stage(), cache_path)
	}

	fn get_material_resource(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		query: &QueryContext,
	) -> Option<hd::MaterialNetwork> {
		if !is_child(cache_path) {
			return None;
		}
		self.with_proto(prim.stage(), cache_path, |proto, adapter| {
			adapter.get_material_resource(proto, cache_path, query)
		})
		.flatten()
	}

	fn get_render_tag(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		_instance_purpose: Option<&tf::Token>,
	) -> tf::Token {
		if !is_child(cache_path) {
			return usd_geom::compute_purpose(prim);
		}
		let purpose = self.bucket_purpose(cache_path);
		self.with_proto(prim.stage(), cache_path, |proto, adapter| {
			adapter.get_render_tag(proto, cache_path, purpose.as_ref())
		})
		.unwrap_or_else(|| usd_geom::TOKENS.default_.clone())
	}

	fn get_instance_indices(
		&self,
		prim: &usd::Prim,
		instancer_cache_path: &sdf::Path,
		_prototype_cache_path: &sdf::Path,
		query: &QueryContext,
	) -> Vec<i32> {
		let stage = prim.stage();
		let arena = self.arena.read();
		let Some(record) = arena.records.get(instancer_cache_path) else {
			coding_error!("<{instancer_cache_path}> is not an instancer");
			return Vec::new();
		};
		let mut cache = record.cache.lock();
		self.update_visibility(&arena, stage, instancer_cache_path, &mut cache);

		let mut indices = Vec::new();
		for (context, index) in InstanceContexts::new(&arena, stage, instancer_cache_path) {
			if context.iter().any(|path| query.is_invised(path)) || query.is_invised(&path_from_chain(&context)) {
				continue;
			}
			let visible = match cache.visibility.get(index) {
				Some(Visibility::Visible) => true,
				Some(Visibility::Invisible) => false,
				_ => self.evaluate_visibility(stage, &context, query.time),
			};
			if visible {
				indices.push(index as i32);
			}
		}
		indices
	}

	fn get_instancer_id(&self, _prim: &usd::Prim, cache_path: &sdf::Path) -> sdf::Path {
		if is_child(cache_path) {
			cache_path.prim_path()
		} else {
			sdf::Path::empty_path()
		}
	}

	fn get_instancer_prototypes(&self, _prim: &usd::Prim, cache_path: &sdf::Path) -> Vec<sdf::Path> {
		if is_child(cache_path) {
			return Vec::new();
		}
		self.arena
			.read()
			.records
			.get(cache_path)
			.map(|record| record.prim_map.keys().cloned().collect())
			.unwrap_or_default()
	}

	fn get_scene_prim_path(&self, prim: &usd::Prim, cache_path: &sdf::Path, instance_index: usize) -> sdf::Path {
		let stage = prim.stage();
		let instancer = cache_path.prim_path();
		let arena = self.arena.read();
		let Some(record) = arena.records.get(&instancer) else {
			return sdf::Path::empty_path();
		};

		let mut chain = Vec::new();
		if is_child(cache_path) {
			let Some(proto) = record.prim_map.get(cache_path) else {
				return sdf::Path::empty_path();
			};
			// A populated prototype root is keyed on the instance itself.
			if !stage.prim_at_path(&proto.path).is_some_and(|proto| proto.is_instance()) {
				chain.push(proto.path.clone());
			}
		}

		let Some((context, _)) =
			InstanceContexts::new(&arena, stage, &instancer).find(|(_, index)| *index == instance_index)
		else {
			return sdf::Path::empty_path();
		};
		chain.extend(context);
		path_from_chain(&chain)
	}

	fn sample_transform(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		query: &QueryContext,
		interval: (f64, f64),
		max_samples: usize,
	) -> Vec<(f64, DMat4)> {
		if !is_child(cache_path) {
			return sample_at_times(&[], query, max_samples, |_| DMat4::IDENTITY);
		}
		self.with_proto(prim.stage(), cache_path, |proto, adapter| {
			adapter.sample_transform(proto, cache_path, query, interval, max_samples)
		})
		.unwrap_or_default()
	}

	/// Instancer primvars sample at the union of the sample times along
	/// every instance context.
	fn sample_primvar(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		key: &tf::Token,
		query: &QueryContext,
		interval: (f64, f64),
		max_samples: usize,
	) -> Vec<(f64, vt::Value)> {
		let stage = prim.stage();
		if is_child(cache_path) {
			return self
				.with_proto(stage, cache_path, |proto, adapter| {
					adapter.sample_primvar(proto, cache_path, key, query, interval, max_samples)
				})
				.unwrap_or_default();
		}

		let is_transform = *key == hd::TOKENS.instance_transform;
		let mut times: Vec<f64> = self.instance_contexts(stage, cache_path, |contexts| {
			contexts
				.flat_map(|(context, _)| {
					if is_transform {
						return context_prims(stage, &context)
							.iter()
							.flat_map(|prim| usd_geom::transform_time_samples_in_interval(prim, interval.0, interval.1))
							.collect::<Vec<_>>();
					}
					let Some(proxy) = stage.prim_at_path(path_from_chain(&context)) else {
						return Vec::new();
					};
					usd_geom::PrimvarsApi::new(&proxy)
						.find_primvar_with_inheritance(key)
						.map(|primvar| primvar.attr.time_samples_in_interval(interval.0, interval.1))
						.unwrap_or_default()
				})
				.collect()
		});
		times.sort_by(f64::total_cmp);
		times.dedup();

		sample_at_times(&times, query, max_samples, |query| self.get(prim, cache_path, key, query))
			.into_iter()
			.filter_map(|(time, value)| value.map(|value| (time, value)))
			.collect()
	}

	fn primvar_names(&self, prim: &usd::Prim, cache_path: &sdf::Path) -> Vec<tf::Token> {
		if is_child(cache_path) {
			return self
				.with_proto(prim.stage(), cache_path, |proto, adapter| adapter.primvar_names(proto, cache_path))
				.unwrap_or_default();
		}
		std::iter::once(hd::TOKENS.instance_transform.clone())
			.chain(self.inherited_primvar_names(cache_path))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hd::{MemoryRenderIndex, PrimKind};
	use crate::usd_imaging::index_proxy::Bookkeeping;
	use crate::usd_imaging::{AdapterRegistry, DelegateConfig};
	use glam::DVec3;
	use std::sync::Arc;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	fn t(s: &str) -> tf::Token {
		tf::Token::new(s)
	}

	/// /World/A and /World/B instance /__Proto_1 holding a single mesh.
	fn two_instances() -> Arc<usd::Stage> {
		let stage = usd::Stage::new();
		stage.define_prototype("/__Proto_1").unwrap();
		stage.define_prim("/__Proto_1/Mesh", "Mesh").unwrap();
		for instance in ["/World/A", "/World/B"] {
			stage.define_prim(instance, "Xform").unwrap();
			stage.set_instance(instance, "/__Proto_1").unwrap();
		}
		stage
	}

	struct Fixture {
		stage: Arc<usd::Stage>,
		adapter: Arc<InstanceAdapter>,
		registry: AdapterRegistry,
		config: DelegateConfig,
		render_index: MemoryRenderIndex,
		book: Bookkeeping,
	}

	impl Fixture {
		fn new(stage: Arc<usd::Stage>) -> Self {
			let adapter = Arc::new(InstanceAdapter::new());
			Self {
				stage,
				registry: AdapterRegistry::with_builtin_instancing(adapter.clone()),
				adapter,
				config: DelegateConfig::default(),
				render_index: MemoryRenderIndex::new(),
				book: Bookkeeping::default(),
			}
		}

		fn with_index<R>(&mut self, f: impl FnOnce(&InstanceAdapter, &mut IndexProxy) -> R) -> R {
			let mut index = IndexProxy::new(
				&self.stage,
				&self.registry,
				&self.config,
				QueryContext::new(usd::TimeCode::DEFAULT, &[]),
				&mut self.render_index,
				&mut self.book,
			);
			let result = f(&self.adapter, &mut index);
			index.process_removals();
			result
		}

		fn populate(&mut self, paths: &[&str]) -> Vec<sdf::Path> {
			let stage = self.stage.clone();
			self.with_index(|adapter, index| {
				paths
					.iter()
					.map(|path| {
						let prim = stage.prim_at_path(*path).unwrap();
						adapter.populate(&prim, index, None)
					})
					.collect()
			})
		}

		fn indices(&self, instancer: &str, time: usd::TimeCode) -> Vec<i32> {
			let prim = self.stage.prim_at_path(instancer).unwrap();
			self.adapter
				.get_instance_indices(&prim, &p(instancer), &sdf::Path::empty_path(), &QueryContext::new(time, &[]))
		}
	}

	#[test]
	fn matching_instances_share_one_instancer() {
		let mut fixture = Fixture::new(two_instances());
		let instancers = fixture.populate(&["/World/A", "/World/B"]);

		assert_eq!(instancers, vec![p("/World/A"), p("/World/A")]);
		assert_eq!(fixture.adapter.instancers(), vec![p("/World/A")]);
		assert!(fixture.render_index.contains(PrimKind::Instancer, &p("/World/A")));
		assert!(fixture.render_index.contains(PrimKind::Rprim, &p("/World/A.proto_Mesh_id0")));
		assert_eq!(fixture.render_index.rprim_ids().len(), 1);

		let instancer = fixture.stage.prim_at_path("/World/A").unwrap();
		assert_eq!(
			fixture.adapter.get_instancer_prototypes(&instancer, &p("/World/A")),
			vec![p("/World/A.proto_Mesh_id0")]
		);
		assert_eq!(
			fixture.adapter.get_instancer_id(&instancer, &p("/World/A.proto_Mesh_id0")),
			p("/World/A")
		);
		assert_eq!(fixture.indices("/World/A", usd::TimeCode::DEFAULT), vec![0, 1]);
	}

	#[test]
	fn material_binding_splits_buckets() {
		let stage = two_instances();
		stage.define_prim("/Looks/Red", "Material").unwrap();
		stage
			.set_attribute("/World/B.material:binding", p("/Looks/Red"))
			.unwrap();
		let mut fixture = Fixture::new(stage);
		let instancers = fixture.populate(&["/World/A", "/World/B"]);

		assert_eq!(instancers, vec![p("/World/A"), p("/World/B")]);
		assert_eq!(fixture.indices("/World/A", usd::TimeCode::DEFAULT), vec![0]);
		assert_eq!(fixture.indices("/World/B", usd::TimeCode::DEFAULT), vec![0]);

		let instancer = fixture.stage.prim_at_path("/World/B").unwrap();
		assert_eq!(
			fixture
				.adapter
				.get_material_id(&instancer, &p("/World/B.proto_Mesh_id0")),
			p("/Looks/Red")
		);
	}

	#[test]
	fn static_visibility_is_classified_once() {
		let stage = two_instances();
		stage.set_attribute("/World/B.visibility", t("invisible")).unwrap();
		let mut fixture = Fixture::new(stage);
		fixture.populate(&["/World/A", "/World/B"]);

		assert_eq!(fixture.indices("/World/A", usd::TimeCode::DEFAULT), vec![0]);
		let evaluations = fixture.adapter.visibility_evaluations();
		assert_eq!(evaluations, 2);
		assert_eq!(fixture.indices("/World/A", usd::TimeCode::new(10.0)), vec![0]);
		assert_eq!(fixture.adapter.visibility_evaluations(), evaluations);
	}

	#[test]
	fn animated_visibility_is_evaluated_per_time() {
		let stage = two_instances();
		stage
			.set_time_samples(
				"/World/B.visibility",
				[(1.0, vt::Value::from(t("inherited"))), (5.0, vt::Value::from(t("invisible")))],
			)
			.unwrap();
		let mut fixture = Fixture::new(stage.clone());
		fixture.populate(&["/World/A", "/World/B"]);

		let prim = stage.prim_at_path("/World/A").unwrap();
		let mut bits = DirtyBits::CLEAN;
		fixture.adapter.track_variability(
			&prim,
			&p("/World/A"),
			&QueryContext::new(usd::TimeCode::DEFAULT, &[]),
			&mut bits,
		);
		assert!(bits.contains(DirtyBits::INSTANCE_INDEX));

		let classified = fixture.adapter.visibility_evaluations();
		assert_eq!(fixture.indices("/World/A", usd::TimeCode::new(1.0)), vec![0, 1]);
		assert_eq!(fixture.indices("/World/A", usd::TimeCode::new(6.0)), vec![0]);
		assert_eq!(fixture.adapter.visibility_evaluations(), classified + 2);
	}

	#[test]
	fn visibility_edit_reclassifies_only_affected_instances() {
		let stage = two_instances();
		let mut fixture = Fixture::new(stage.clone());
		fixture.populate(&["/World/A", "/World/B"]);
		assert_eq!(fixture.indices("/World/A", usd::TimeCode::DEFAULT), vec![0, 1]);
		let before = fixture.adapter.visibility_evaluations();

		stage.set_attribute("/World/B.visibility", t("invisible")).unwrap();
		let prim = stage.prim_at_path("/World/A").unwrap();
		let bits = fixture
			.adapter
			.process_property_change(&prim, &p("/World/A"), &p("/World/B.visibility"));
		assert_eq!(bits, DirtyBits::INSTANCE_INDEX);

		assert_eq!(fixture.indices("/World/A", usd::TimeCode::DEFAULT), vec![0]);
		assert_eq!(fixture.adapter.visibility_evaluations(), before + 1);
	}

	#[test]
	fn instance_transforms_compose_the_context() {
		let stage = two_instances();
		stage
			.set_attribute("/World.xformOp:translate", DVec3::new(0.0, 0.0, 1.0))
			.unwrap();
		stage.set_attribute("/World.xformOpOrder", vec![t("xformOp:translate")]).unwrap();
		stage
			.set_attribute("/World/B.xformOp:translate", DVec3::new(2.0, 0.0, 0.0))
			.unwrap();
		stage
			.set_attribute("/World/B.xformOpOrder", vec![t("xformOp:translate")])
			.unwrap();
		let mut fixture = Fixture::new(stage.clone());
		fixture.populate(&["/World/A", "/World/B"]);

		let cache = ValueCache::new();
		let prim = stage.prim_at_path("/World/A").unwrap();
		fixture.adapter.update_for_time(
			&prim,
			&p("/World/A"),
			&QueryContext::new(usd::TimeCode::DEFAULT, &[]),
			DirtyBits::PRIMVAR,
			&cache,
		);
		let transforms = cache
			.value(&p("/World/A"), &hd::TOKENS.instance_transform)
			.and_then(|value| value.get::<vt::Array<DMat4>>())
			.unwrap();
		assert_eq!(transforms[0], DMat4::from_translation(DVec3::new(0.0, 0.0, 1.0)));
		assert_eq!(transforms[1], DMat4::from_translation(DVec3::new(2.0, 0.0, 1.0)));
		assert!(
			cache
				.primvar_names(&p("/World/A"))
				.unwrap()
				.contains(&hd::TOKENS.instance_transform)
		);
	}

	#[test]
	fn nested_prototypes_draw_once_per_outer_instance() {
		let stage = usd::Stage::new();
		stage.define_prototype("/__Proto_2").unwrap();
		stage.define_prim("/__Proto_2/Mesh", "Mesh").unwrap();
		stage.define_prototype("/__Proto_1").unwrap();
		stage.define_prim("/__Proto_1/Inner", "Xform").unwrap();
		stage.set_instance("/__Proto_1/Inner", "/__Proto_2").unwrap();
		for instance in ["/World/A", "/World/B", "/World/C"] {
			stage.define_prim(instance, "Xform").unwrap();
			stage.set_instance(instance, "/__Proto_1").unwrap();
		}
		let mut fixture = Fixture::new(stage.clone());
		fixture.populate(&["/World/A", "/World/B", "/World/C"]);

		assert_eq!(fixture.adapter.instancers(), vec![p("/World/A"), p("/__Proto_1/Inner")]);
		assert_eq!(fixture.adapter.instance_count(&stage, &p("/__Proto_1/Inner")), 3);
		assert!(fixture.render_index.contains(PrimKind::Rprim, &p("/__Proto_1/Inner.proto_Mesh_id0")));
		assert_eq!(fixture.indices("/__Proto_1/Inner", usd::TimeCode::DEFAULT), vec![0, 1, 2]);

		let inner = stage.prim_at_path("/__Proto_1/Inner").unwrap();
		assert_eq!(
			fixture
				.adapter
				.get_scene_prim_path(&inner, &p("/__Proto_1/Inner.proto_Mesh_id0"), 1),
			p("/World/B/Inner/Mesh")
		);
	}

	#[test]
	fn scene_prim_path_resolves_through_the_instance() {
		let mut fixture = Fixture::new(two_instances());
		fixture.populate(&["/World/A", "/World/B"]);
		let instancer = fixture.stage.prim_at_path("/World/A").unwrap();
		let adapter = &fixture.adapter;

		assert_eq!(
			adapter.get_scene_prim_path(&instancer, &p("/World/A.proto_Mesh_id0"), 1),
			p("/World/B/Mesh")
		);
		assert_eq!(adapter.get_scene_prim_path(&instancer, &p("/World/A"), 0), p("/World/A"));
		assert!(
			adapter
				.get_scene_prim_path(&instancer, &p("/World/A.proto_Mesh_id0"), 7)
				.is_empty()
		);
	}

	#[test]
	fn resync_unloads_and_queues_repopulation() {
		let mut fixture = Fixture::new(two_instances());
		fixture.populate(&["/World/A", "/World/B"]);

		let repopulate = fixture.with_index(|adapter, index| {
			adapter.process_prim_resync(&p("/World/A.proto_Mesh_id0"), index);
			index.take_paths_to_repopulate()
		});
		assert_eq!(repopulate, vec![p("/World/A"), p("/World/B")]);
		assert!(fixture.adapter.instancers().is_empty());
		assert!(!fixture.render_index.contains(PrimKind::Instancer, &p("/World/A")));
		assert!(!fixture.render_index.contains(PrimKind::Rprim, &p("/World/A.proto_Mesh_id0")));

		let instancers = fixture.populate(&["/World/A", "/World/B"]);
		assert_eq!(instancers, vec![p("/World/A"), p("/World/A")]);
		assert!(fixture.render_index.contains(PrimKind::Rprim, &p("/World/A.proto_Mesh_id0")));
	}

	#[test]
	fn directly_instanced_gprim_is_skipped() {
		let stage = usd::Stage::new();
		stage.define_prototype("/__Proto_1").unwrap();
		stage.define_prim("/__Proto_1", "Sphere").unwrap();
		stage.define_prim("/World/Ball", "Sphere").unwrap();
		stage.set_instance("/World/Ball", "/__Proto_1").unwrap();
		let mut fixture = Fixture::new(stage);

		let instancers = fixture.populate(&["/World/Ball"]);
		assert_eq!(instancers, vec![p("/World/Ball")]);
		assert!(fixture.render_index.rprim_ids().is_empty());
	}

	#[test]
	fn property_changes_route_by_category() {
		let mut fixture = Fixture::new(two_instances());
		fixture.populate(&["/World/A", "/World/B"]);
		let prim = fixture.stage.prim_at_path("/World/A").unwrap();
		let change = |cache: &str, property: &str| fixture.adapter.process_property_change(&prim, &p(cache), &p(property));

		assert_eq!(change("/World/A", "/World/B.purpose"), DirtyBits::ALL_DIRTY);
		assert_eq!(change("/World/A", "/World/B.xformOp:translate"), DirtyBits::PRIMVAR);
		assert_eq!(change("/World/A", "/World/B.primvars:displayColor"), DirtyBits::PRIMVAR);
		assert_eq!(change("/World/A", "/World/B.userProperty"), DirtyBits::CLEAN);
		assert_eq!(change("/World/A.proto_Mesh_id0", "/__Proto_1/Mesh.points"), DirtyBits::POINTS);
	}
}
