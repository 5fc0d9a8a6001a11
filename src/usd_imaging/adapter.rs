use super::{IndexProxy, ValueCache, is_ignored_prim_field};
use crate::hd::{self, DirtyBits};
use crate::{sdf, tf, usd, usd_geom, usd_shade, vt};
use glam::DMat4;
use std::sync::Arc;

/// Population state handed from an instancer to the adapters of its prototype prims.
#[derive(Clone, Default)]
pub struct InstancerContext {
	/// Cache path of the renderer instancer the prototype belongs to.
	pub instancer_cache_path: sdf::Path,
	/// Name under which the prototype is relocated below the instancer.
	pub child_name: tf::Token,
	/// Material inherited from the instance, used when the prototype prim binds none.
	pub instancer_material_usd_path: sdf::Path,
	/// Adapter that owns the prototype's prim info entries.
	pub instancer_adapter: Option<Arc<dyn PrimAdapter>>,
}

impl std::fmt::Debug for InstancerContext {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("InstancerContext")
			.field("instancer_cache_path", &self.instancer_cache_path)
			.field("child_name", &self.child_name)
			.field("instancer_material_usd_path", &self.instancer_material_usd_path)
			.field("instancer_adapter", &self.instancer_adapter.as_ref().map(|a| a.name()))
			.finish()
	}
}

/// Cache path for `usd_path`, relocated below the instancer when populated
/// on behalf of one.
pub fn resolve_cache_path(usd_path: &sdf::Path, instancer_context: Option<&InstancerContext>) -> sdf::Path {
	match instancer_context {
		Some(ctx) if !ctx.child_name.is_empty() => ctx.instancer_cache_path.append_property(&ctx.child_name),
		_ => usd_path.clone(),
	}
}

/// Delegate state consulted by adapter queries.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
	pub time: usd::TimeCode,
	invised_paths: &'a [sdf::Path],
}

impl<'a> QueryContext<'a> {
	pub fn new(time: usd::TimeCode, invised_paths: &'a [sdf::Path]) -> Self {
		Self { time, invised_paths }
	}

	/// The same context evaluated at another time.
	pub fn at(&self, time: usd::TimeCode) -> Self {
		Self { time, ..*self }
	}

	/// Return true if `path` is at or below a prim forced invisible by the delegate.
	pub fn is_invised(&self, path: &sdf::Path) -> bool {
		self.invised_paths.iter().any(|invised| path.has_prefix(invised))
	}
}

/// Translates one kind of scene prim into render index prims.
///
/// Adapters are shared across threads and hold no per-prim state except
/// where noted; all bookkeeping goes through the [`IndexProxy`].
pub trait PrimAdapter: Send + Sync {
	fn name(&self) -> &'static str;

	/// Insert render index prims for `prim` and return the main cache path,
	/// or the empty path if nothing was inserted.
	fn populate(
		&self,
		prim: &usd::Prim,
		index: &mut IndexProxy,
		instancer_context: Option<&InstancerContext>,
	) -> sdf::Path;

	/// Skip the prim's descendants during population.
	fn should_cull_children(&self) -> bool {
		false
	}

	/// Populate the prim's instance subtrees as ordinary prims.
	fn should_ignore_native_instance_subtrees(&self) -> bool {
		false
	}

	fn is_instancer_adapter(&self) -> bool {
		false
	}

	/// Allow populating the root prim of a prototype directly.
	fn can_populate_usd_instance(&self) -> bool {
		false
	}

	/// Accumulate the categories of `cache_path` that vary over time.
	fn track_variability(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		query: &QueryContext,
		time_varying_bits: &mut DirtyBits,
	);

	/// Pull the `requested_bits` categories at `query.time` into `cache`.
	fn update_for_time(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		query: &QueryContext,
		requested_bits: DirtyBits,
		cache: &ValueCache,
	);

	/// Dirty bits for an edit of the property at `property_path`, which may
	/// belong to an ancestor of `prim` for inherited properties.
	/// [`DirtyBits::ALL_DIRTY`] requests a resync.
	fn process_property_change(&self, prim: &usd::Prim, cache_path: &sdf::Path, property_path: &sdf::Path) -> DirtyBits;

	/// Dirty bits for an edit of prim-level metadata fields.
	fn process_prim_change(&self, _prim: &usd::Prim, _cache_path: &sdf::Path, changed_fields: &[tf::Token]) -> DirtyBits {
		if changed_fields.iter().all(is_ignored_prim_field) {
			DirtyBits::CLEAN
		} else {
			DirtyBits::ALL_DIRTY
		}
	}

	/// Remove `cache_path` and schedule its scene path for repopulation.
	fn process_prim_resync(&self, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.remove_prim(cache_path, index);
		index.repopulate(cache_path);
	}

	fn process_prim_removal(&self, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.remove_prim(cache_path, index);
	}

	/// Queue removal of the render index prims inserted for `cache_path`.
	fn remove_prim(&self, cache_path: &sdf::Path, index: &mut IndexProxy);

	fn mark_dirty(&self, prim: &usd::Prim, cache_path: &sdf::Path, dirty: DirtyBits, index: &mut IndexProxy);

	fn mark_transform_dirty(&self, prim: &usd::Prim, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.mark_dirty(prim, cache_path, DirtyBits::TRANSFORM, index);
	}

	fn mark_visibility_dirty(&self, prim: &usd::Prim, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.mark_dirty(prim, cache_path, DirtyBits::VISIBILITY, index);
	}

	fn mark_material_dirty(&self, prim: &usd::Prim, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.mark_dirty(prim, cache_path, DirtyBits::MATERIAL_ID, index);
	}

	fn get_transform(&self, prim: &usd::Prim, _cache_path: &sdf::Path, query: &QueryContext) -> DMat4 {
		usd_geom::compute_local_to_world(prim, query.time)
	}

	fn get_visible(&self, prim: &usd::Prim, _cache_path: &sdf::Path, query: &QueryContext) -> bool {
		!query.is_invised(prim.path()) && usd_geom::compute_visibility(prim, query.time)
	}

	/// Value of attribute `key`, falling back to the primvar of that name.
	fn get(&self, prim: &usd::Prim, _cache_path: &sdf::Path, key: &tf::Token, query: &QueryContext) -> Option<vt::Value> {
		if let Some(value) = prim.attribute(key).get(query.time) {
			return Some(value);
		}
		usd_geom::PrimvarsApi::new(prim)
			.find_primvar_with_inheritance(key)
			.and_then(|primvar| primvar.get(query.time))
	}

	fn get_topology(&self, _prim: &usd::Prim, _cache_path: &sdf::Path, _query: &QueryContext) -> Option<hd::Topology> {
		None
	}

	fn get_extent(&self, prim: &usd::Prim, _cache_path: &sdf::Path, query: &QueryContext) -> hd::Range3d {
		extent_attribute(prim, query.time)
	}

	fn get_material_id(&self, prim: &usd::Prim, _cache_path: &sdf::Path) -> sdf::Path {
		material_usd_path(prim)
	}

	fn get_material_resource(
		&self,
		_prim: &usd::Prim,
		_cache_path: &sdf::Path,
		_query: &QueryContext,
	) -> Option<hd::MaterialNetwork> {
		None
	}

	/// Render tag from the prim's purpose. A prototype prim that neither
	/// authors nor inherits a purpose takes `instance_purpose`, the purpose
	/// of the instances drawing it.
	fn get_render_tag(
		&self,
		prim: &usd::Prim,
		_cache_path: &sdf::Path,
		instance_purpose: Option<&tf::Token>,
	) -> tf::Token {
		usd_geom::authored_purpose(prim)
			.or_else(|| instance_purpose.cloned())
			.unwrap_or_else(|| usd_geom::TOKENS.default_.clone())
	}

	/// Indices of the instances of `prototype_cache_path` to draw.
	fn get_instance_indices(
		&self,
		_prim: &usd::Prim,
		_instancer_cache_path: &sdf::Path,
		_prototype_cache_path: &sdf::Path,
		_query: &QueryContext,
	) -> Vec<i32> {
		Vec::new()
	}

	fn get_instancer_id(&self, _prim: &usd::Prim, _cache_path: &sdf::Path) -> sdf::Path {
		sdf::Path::empty_path()
	}

	fn get_instancer_prototypes(&self, _prim: &usd::Prim, _cache_path: &sdf::Path) -> Vec<sdf::Path> {
		Vec::new()
	}

	fn get_instancer_transform(&self, _prim: &usd::Prim, _cache_path: &sdf::Path, _query: &QueryContext) -> DMat4 {
		DMat4::IDENTITY
	}

	/// Scene path drawn by `instance_index` of `cache_path`.
	fn get_scene_prim_path(&self, _prim: &usd::Prim, cache_path: &sdf::Path, _instance_index: usize) -> sdf::Path {
		cache_path.clone()
	}

	/// Transform samples at the authored times within `[start, end]`, or a
	/// single sample at `query.time` when the transform is not animated.
	fn sample_transform(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		query: &QueryContext,
		interval: (f64, f64),
		max_samples: usize,
	) -> Vec<(f64, DMat4)> {
		let times = usd_geom::transform_time_samples_in_interval(prim, interval.0, interval.1);
		sample_at_times(&times, query, max_samples, |query| {
			self.get_transform(prim, cache_path, query)
		})
	}

	fn sample_primvar(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		key: &tf::Token,
		query: &QueryContext,
		interval: (f64, f64),
		max_samples: usize,
	) -> Vec<(f64, vt::Value)> {
		let times = usd_geom::PrimvarsApi::new(prim)
			.find_primvar_with_inheritance(key)
			.map(|primvar| primvar.attr.time_samples_in_interval(interval.0, interval.1))
			.unwrap_or_default();
		sample_at_times(&times, query, max_samples, |query| {
			self.get(prim, cache_path, key, query)
		})
		.into_iter()
		.filter_map(|(time, value)| value.map(|value| (time, value)))
		.collect()
	}

	/// Names of the primvars published for `cache_path`.
	fn primvar_names(&self, prim: &usd::Prim, _cache_path: &sdf::Path) -> Vec<tf::Token> {
		let mut names: Vec<tf::Token> = usd_geom::PrimvarsApi::new(prim)
			.primvars()
			.iter()
			.map(|primvar| primvar.primvar_name())
			.collect();
		for primvar in usd_geom::PrimvarsApi::new(prim).find_inheritable_primvars() {
			let name = primvar.primvar_name();
			if !names.contains(&name) {
				names.push(name);
			}
		}
		names
	}
}

/// Evaluate `sample` at each of `times`, or once at `query.time` if there are none.
pub(crate) fn sample_at_times<T>(
	times: &[f64],
	query: &QueryContext,
	max_samples: usize,
	mut sample: impl FnMut(&QueryContext) -> T,
) -> Vec<(f64, T)> {
	if times.is_empty() {
		let time = query.time.value().unwrap_or(0.0);
		return vec![(time, sample(query))];
	}

	times
		.iter()
		.take(max_samples.max(1))
		.map(|&time| (time, sample(&query.at(usd::TimeCode::new(time)))))
		.collect()
}

/// Path of the material bound to `prim`, or the empty path.
pub fn material_usd_path(prim: &usd::Prim) -> sdf::Path {
	usd_shade::MaterialBindingApi::new(prim).compute_bound_material()
}

/// Bounds authored in the `extent` attribute.
pub(crate) fn extent_attribute(prim: &usd::Prim, time: usd::TimeCode) -> hd::Range3d {
	prim.attribute(&usd_geom::TOKENS.extent)
		.get_typed::<vt::Array<glam::Vec3>>(time)
		.filter(|extent| extent.len() == 2)
		.map(|extent| hd::Range3d::new(extent[0].as_dvec3(), extent[1].as_dvec3()))
		.unwrap_or_default()
}

/// Dirty bits for a primvar edit.
pub(crate) fn primvar_property_change(property_name: &tf::Token) -> DirtyBits {
	if usd_geom::Primvar::is_valid_primvar_name(property_name.as_str()) {
		DirtyBits::PRIMVAR
	} else {
		DirtyBits::CLEAN
	}
}
