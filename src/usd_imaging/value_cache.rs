use crate::{hd, sdf, tf, vt};
use dashmap::DashMap;
use glam::DMat4;

/// Values pulled by `update_for_time`, keyed by cache path.
///
/// Written concurrently by update workers and read back by the delegate's
/// getters. Cleared whenever scene edits or a time change make it stale.
#[derive(Default, Debug)]
pub struct ValueCache {
	transforms: DashMap<sdf::Path, DMat4>,
	visibility: DashMap<sdf::Path, bool>,
	topology: DashMap<sdf::Path, hd::Topology>,
	extents: DashMap<sdf::Path, hd::Range3d>,
	material_ids: DashMap<sdf::Path, sdf::Path>,
	material_resources: DashMap<sdf::Path, hd::MaterialNetwork>,
	values: DashMap<(sdf::Path, tf::Token), vt::Value>,
	primvar_names: DashMap<sdf::Path, Vec<tf::Token>>,
}

impl ValueCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_transform(&self, cache_path: &sdf::Path, value: DMat4) {
		self.transforms.insert(cache_path.clone(), value);
	}

	pub fn transform(&self, cache_path: &sdf::Path) -> Option<DMat4> {
		self.transforms.get(cache_path).map(|v| *v)
	}

	pub fn set_visible(&self, cache_path: &sdf::Path, value: bool) {
		self.visibility.insert(cache_path.clone(), value);
	}

	pub fn visible(&self, cache_path: &sdf::Path) -> Option<bool> {
		self.visibility.get(cache_path).map(|v| *v)
	}

	pub fn set_topology(&self, cache_path: &sdf::Path, value: hd::Topology) {
		self.topology.insert(cache_path.clone(), value);
	}

	pub fn topology(&self, cache_path: &sdf::Path) -> Option<hd::Topology> {
		self.topology.get(cache_path).map(|v| v.clone())
	}

	pub fn set_extent(&self, cache_path: &sdf::Path, value: hd::Range3d) {
		self.extents.insert(cache_path.clone(), value);
	}

	pub fn extent(&self, cache_path: &sdf::Path) -> Option<hd::Range3d> {
		self.extents.get(cache_path).map(|v| *v)
	}

	pub fn set_material_id(&self, cache_path: &sdf::Path, value: sdf::Path) {
		self.material_ids.insert(cache_path.clone(), value);
	}

	pub fn material_id(&self, cache_path: &sdf::Path) -> Option<sdf::Path> {
		self.material_ids.get(cache_path).map(|v| v.clone())
	}

	pub fn set_material_resource(&self, cache_path: &sdf::Path, value: hd::MaterialNetwork) {
		self.material_resources.insert(cache_path.clone(), value);
	}

	pub fn material_resource(&self, cache_path: &sdf::Path) -> Option<hd::MaterialNetwork> {
		self.material_resources.get(cache_path).map(|v| v.clone())
	}

	/// Store a named value such as a primvar or `doubleSided`.
	pub fn set_value(&self, cache_path: &sdf::Path, key: &tf::Token, value: vt::Value) {
		self.values.insert((cache_path.clone(), key.clone()), value);
	}

	pub fn value(&self, cache_path: &sdf::Path, key: &tf::Token) -> Option<vt::Value> {
		self.values
			.get(&(cache_path.clone(), key.clone()))
			.map(|v| v.clone())
	}

	/// Record the primvar names published for `cache_path`, merging with any
	/// already recorded in this pass.
	pub fn merge_primvar_names(&self, cache_path: &sdf::Path, names: impl IntoIterator<Item = tf::Token>) {
		let mut entry = self.primvar_names.entry(cache_path.clone()).or_default();
		for name in names {
			if !entry.contains(&name) {
				entry.push(name);
			}
		}
	}

	pub fn primvar_names(&self, cache_path: &sdf::Path) -> Option<Vec<tf::Token>> {
		self.primvar_names.get(cache_path).map(|v| v.clone())
	}

	pub fn is_empty(&self) -> bool {
		self.transforms.is_empty()
			&& self.visibility.is_empty()
			&& self.topology.is_empty()
			&& self.extents.is_empty()
			&& self.material_ids.is_empty()
			&& self.material_resources.is_empty()
			&& self.values.is_empty()
			&& self.primvar_names.is_empty()
	}

	pub fn clear(&self) {
		self.transforms.clear();
		self.visibility.clear();
		self.topology.clear();
		self.extents.clear();
		self.material_ids.clear();
		self.material_resources.clear();
		self.values.clear();
		self.primvar_names.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rayon::prelude::*;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	#[test]
	fn concurrent_writers() {
		let cache = ValueCache::new();
		let paths: Vec<sdf::Path> = (0..64).map(|i| p(&format!("/World/Mesh{i}"))).collect();

		paths.par_iter().enumerate().for_each(|(i, path)| {
			cache.set_transform(path, DMat4::from_translation(glam::DVec3::splat(i as f64)));
			cache.merge_primvar_names(path, [tf::Token::new("displayColor")]);
		});

		assert_eq!(
			cache.transform(&p("/World/Mesh3")),
			Some(DMat4::from_translation(glam::DVec3::splat(3.0)))
		);
		assert_eq!(cache.primvar_names(&p("/World/Mesh63")).map(|n| n.len()), Some(1));

		cache.clear();
		assert!(cache.is_empty());
	}
}
