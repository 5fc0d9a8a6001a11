use super::{IndexProxy, InstancerContext, LIGHT_TYPES, PrimAdapter, QueryContext, ValueCache};
use crate::hd::DirtyBits;
use crate::{sdf, tf, usd, usd_geom};
use dashmap::DashMap;

const INPUTS_PREFIX: &str = "inputs:";

/// Adapter for light prims, each becoming one sprim of the matching light type.
#[derive(Debug, Default)]
pub struct LightAdapter {
	/// Sprim type of every populated light, needed again on removal.
	sprim_types: DashMap<sdf::Path, tf::Token>,
}

impl LightAdapter {
	pub fn new() -> Self {
		Self::default()
	}

	fn sprim_type(type_name: &tf::Token) -> Option<tf::Token> {
		LIGHT_TYPES
			.iter()
			.find(|(schema, _)| type_name == *schema)
			.map(|(_, sprim)| tf::Token::new(sprim))
	}

	fn inputs<'a>(prim: &usd::Prim<'a>) -> Vec<usd::Attribute<'a>> {
		prim.attributes()
			.into_iter()
			.filter(|attr| attr.name().as_str().starts_with(INPUTS_PREFIX))
			.collect()
	}
}

impl PrimAdapter for LightAdapter {
	fn name(&self) -> &'static str {
		"light"
	}

	fn populate(
		&self,
		prim: &usd::Prim,
		index: &mut IndexProxy,
		instancer_context: Option<&InstancerContext>,
	) -> sdf::Path {
		if instancer_context.is_some() {
			log::warn!("Instanced light <{}> is not supported", prim.path());
			return sdf::Path::empty_path();
		}
		let Some(sprim_type) = Self::sprim_type(&prim.type_name()) else {
			super::diagnostic::coding_error!("Light adapter cannot image <{}> of type {}", prim.path(), prim.type_name());
			return sdf::Path::empty_path();
		};

		let cache_path = prim.path().clone();
		index.insert_sprim(&sprim_type, &cache_path, prim, None);
		if index.is_populated(&cache_path) {
			self.sprim_types.insert(cache_path.clone(), sprim_type);
		}
		cache_path
	}

	fn track_variability(
		&self,
		prim: &usd::Prim,
		_cache_path: &sdf::Path,
		_query: &QueryContext,
		time_varying_bits: &mut DirtyBits,
	) {
		if usd_geom::transform_might_be_time_varying(prim) {
			*time_varying_bits |= DirtyBits::LIGHT_TRANSFORM;
		}
		if usd_geom::visibility_might_be_time_varying(prim)
			|| Self::inputs(prim).iter().any(|attr| attr.might_be_time_varying())
		{
			*time_varying_bits |= DirtyBits::LIGHT_PARAMS;
		}
	}

	fn update_for_time(
		&self,
		prim: &usd::Prim,
		cache_path: &sdf::Path,
		query: &QueryContext,
		requested_bits: DirtyBits,
		cache: &ValueCache,
	) {
		if requested_bits.contains(DirtyBits::LIGHT_TRANSFORM) {
			cache.set_transform(cache_path, self.get_transform(prim, cache_path, query));
		}
		if requested_bits.contains(DirtyBits::LIGHT_PARAMS) {
			cache.set_visible(cache_path, self.get_visible(prim, cache_path, query));
			for attr in Self::inputs(prim) {
				if let Some(value) = attr.get(query.time) {
					cache.set_value(cache_path, &attr.name(), value);
				}
			}
		}
	}

	fn process_property_change(&self, _prim: &usd::Prim, _cache_path: &sdf::Path, property_path: &sdf::Path) -> DirtyBits {
		let name = property_path.name_token();
		if usd_geom::XformOp::is_transformation_affected_by_attr_named(&name) {
			DirtyBits::LIGHT_TRANSFORM
		} else if name == usd_geom::TOKENS.visibility || name.as_str().starts_with(INPUTS_PREFIX) {
			DirtyBits::LIGHT_PARAMS
		} else {
			DirtyBits::LIGHT_PARAMS | DirtyBits::LIGHT_RESOURCE
		}
	}

	fn remove_prim(&self, cache_path: &sdf::Path, index: &mut IndexProxy) {
		match self.sprim_types.remove(cache_path) {
			Some((_, sprim_type)) => index.remove_sprim(&sprim_type, cache_path),
			None => log::debug!("Light <{cache_path}> was never populated"),
		}
	}

	fn mark_dirty(&self, _prim: &usd::Prim, cache_path: &sdf::Path, dirty: DirtyBits, index: &mut IndexProxy) {
		index.mark_sprim_dirty(cache_path, dirty);
	}

	fn mark_transform_dirty(&self, prim: &usd::Prim, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.mark_dirty(prim, cache_path, DirtyBits::LIGHT_TRANSFORM, index);
	}

	fn mark_visibility_dirty(&self, prim: &usd::Prim, cache_path: &sdf::Path, index: &mut IndexProxy) {
		self.mark_dirty(prim, cache_path, DirtyBits::LIGHT_PARAMS, index);
	}
}
