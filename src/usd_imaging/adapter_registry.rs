use super::{
	DelegateConfig, GPRIM_TYPES, GprimAdapter, InstanceAdapter, LIGHT_TYPES, LightAdapter, MaterialAdapter, PrimAdapter,
	TOKENS,
};
use crate::{tf, usd};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps prim type names to the adapters that image them.
///
/// Instances are routed to the instance adapter regardless of their type.
/// The instance adapter keeps per-scene state, so each delegate needs its
/// own registry.
pub struct AdapterRegistry {
	by_type: HashMap<tf::Token, Arc<dyn PrimAdapter>>,
	instance_adapter: Arc<dyn PrimAdapter>,
}

impl AdapterRegistry {
	/// An empty registry whose instances resolve through `instance_adapter`.
	pub fn new(instance_adapter: Arc<dyn PrimAdapter>) -> Self {
		Self {
			by_type: HashMap::new(),
			instance_adapter,
		}
	}

	/// A registry with the gprim, material, light and instance adapters.
	pub fn with_builtin() -> Self {
		Self::with_builtin_instancing(Arc::new(InstanceAdapter::new()))
	}

	/// The builtin adapters, resolving instances through `instance_adapter`.
	pub fn with_builtin_instancing(instance_adapter: Arc<dyn PrimAdapter>) -> Self {
		let mut registry = Self::new(instance_adapter);

		let gprim: Arc<dyn PrimAdapter> = Arc::new(GprimAdapter::new());
		for (type_name, _) in GPRIM_TYPES {
			registry.register(type_name, gprim.clone());
		}

		registry.register(TOKENS.material.as_str(), Arc::new(MaterialAdapter::new()));

		let light: Arc<dyn PrimAdapter> = Arc::new(LightAdapter::new());
		for (type_name, _) in LIGHT_TYPES {
			registry.register(type_name, light.clone());
		}

		registry
	}

	/// Register `adapter` for prims of `type_name`, replacing any previous one.
	pub fn register(&mut self, type_name: &str, adapter: Arc<dyn PrimAdapter>) {
		if let Some(previous) = self.by_type.insert(tf::Token::new(type_name), adapter) {
			log::debug!("Replacing {} adapter for type {}", previous.name(), type_name);
		}
	}

	pub fn instance_adapter(&self) -> &Arc<dyn PrimAdapter> {
		&self.instance_adapter
	}

	pub fn adapter_for_type(&self, type_name: &tf::Token) -> Option<&Arc<dyn PrimAdapter>> {
		self.by_type.get(type_name)
	}

	/// The adapter for `prim`. Instances map to the instance adapter unless
	/// `ignore_instancing` is set, in which case their own type decides.
	pub fn adapter_for(&self, prim: &usd::Prim, ignore_instancing: bool) -> Option<Arc<dyn PrimAdapter>> {
		if !ignore_instancing && prim.is_instance() {
			return Some(self.instance_adapter.clone());
		}
		self.by_type.get(&prim.type_name()).cloned()
	}

	/// Like [`AdapterRegistry::adapter_for`], but yields nothing for prim
	/// types switched off in `config`.
	pub(crate) fn configured_adapter_for(
		&self,
		prim: &usd::Prim,
		ignore_instancing: bool,
		config: &DelegateConfig,
	) -> Option<Arc<dyn PrimAdapter>> {
		if ignore_instancing || !prim.is_instance() {
			let type_name = prim.type_name();
			if !config.scene_materials_enabled && type_name == TOKENS.material {
				return None;
			}
			if !config.scene_lights_enabled && LIGHT_TYPES.iter().any(|(name, _)| type_name == *name) {
				return None;
			}
		}
		self.adapter_for(prim, ignore_instancing)
	}
}

impl Default for AdapterRegistry {
	fn default() -> Self {
		Self::with_builtin()
	}
}

impl std::fmt::Debug for AdapterRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let mut types: Vec<(&str, &str)> = self
			.by_type
			.iter()
			.map(|(type_name, adapter)| (type_name.as_str(), adapter.name()))
			.collect();
		types.sort();
		f.debug_struct("AdapterRegistry")
			.field("by_type", &types)
			.field("instance_adapter", &self.instance_adapter.name())
			.finish()
	}
}
