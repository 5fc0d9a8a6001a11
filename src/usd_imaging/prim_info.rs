use super::PrimAdapter;
use crate::{hd::DirtyBits, sdf};
use std::collections::HashMap;
use std::sync::Arc;

/// Bookkeeping for one populated cache path.
#[derive(Clone)]
pub struct PrimInfo {
	/// Scene path the cache path was populated from. Prototype prims of an
	/// instancer record the instancer's prim here.
	pub usd_path: sdf::Path,
	pub adapter: Arc<dyn PrimAdapter>,
	/// Categories that change over time, found by `track_variability`.
	pub time_varying_bits: DirtyBits,
	/// Categories to pull in the next update pass.
	pub dirty_bits: DirtyBits,
}

impl std::fmt::Debug for PrimInfo {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("PrimInfo")
			.field("usd_path", &self.usd_path)
			.field("adapter", &self.adapter.name())
			.field("time_varying_bits", &self.time_varying_bits)
			.field("dirty_bits", &self.dirty_bits)
			.finish()
	}
}

/// Cache path to [`PrimInfo`] for everything currently in the render index.
#[derive(Default, Debug)]
pub struct PrimInfoTable {
	entries: HashMap<sdf::Path, PrimInfo>,
}

impl PrimInfoTable {
	pub fn get(&self, cache_path: &sdf::Path) -> Option<&PrimInfo> {
		self.entries.get(cache_path)
	}

	pub fn get_mut(&mut self, cache_path: &sdf::Path) -> Option<&mut PrimInfo> {
		self.entries.get_mut(cache_path)
	}

	pub fn contains(&self, cache_path: &sdf::Path) -> bool {
		self.entries.contains_key(cache_path)
	}

	/// Insert a fresh entry, returning false if the cache path was already populated.
	pub fn insert(&mut self, cache_path: sdf::Path, usd_path: sdf::Path, adapter: Arc<dyn PrimAdapter>) -> bool {
		let info = PrimInfo {
			usd_path,
			adapter,
			time_varying_bits: DirtyBits::CLEAN,
			dirty_bits: DirtyBits::ALL_DIRTY,
		};
		self.entries.insert(cache_path, info).is_none()
	}

	pub fn remove(&mut self, cache_path: &sdf::Path) -> Option<PrimInfo> {
		self.entries.remove(cache_path)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&sdf::Path, &PrimInfo)> {
		self.entries.iter()
	}

	/// Cache paths in path order.
	pub fn cache_paths(&self) -> Vec<sdf::Path> {
		let mut paths: Vec<sdf::Path> = self.entries.keys().cloned().collect();
		paths.sort();
		paths
	}

	/// Ordered `(cache path, usd path, adapter name, time-varying bits)`
	/// rows, for comparing table states.
	pub fn snapshot(&self) -> Vec<(sdf::Path, sdf::Path, &'static str, DirtyBits)> {
		let mut rows: Vec<_> = self
			.entries
			.iter()
			.map(|(cache_path, info)| {
				(
					cache_path.clone(),
					info.usd_path.clone(),
					info.adapter.name(),
					info.time_varying_bits,
				)
			})
			.collect();
		rows.sort_by(|a, b| a.0.cmp(&b.0));
		rows
	}
}
