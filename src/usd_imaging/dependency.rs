use crate::sdf;
use std::collections::{BTreeSet, HashMap};

/// Sorted multimap from scene path to the cache paths computed from it.
///
/// Because [`sdf::Path`] orders every subtree contiguously, all edges whose
/// scene path lies under a root form one range of the edge set.
#[derive(Default, Debug, Clone)]
pub struct DependencyIndex {
	edges: BTreeSet<(sdf::Path, sdf::Path)>,
	by_cache_path: HashMap<sdf::Path, Vec<sdf::Path>>,
}

impl DependencyIndex {
	/// Record that `cache_path` depends on `usd_path`. Duplicate edges are ignored.
	pub fn add(&mut self, usd_path: &sdf::Path, cache_path: &sdf::Path) {
		if self.edges.insert((usd_path.clone(), cache_path.clone())) {
			self.by_cache_path
				.entry(cache_path.clone())
				.or_default()
				.push(usd_path.clone());
		}
	}

	/// Cache paths depending on exactly `usd_path`, in path order.
	pub fn equal_range<'a>(&'a self, usd_path: &sdf::Path) -> impl Iterator<Item = &'a sdf::Path> + use<'a> {
		let usd_path = usd_path.clone();
		self.edges
			.range((usd_path.clone(), sdf::Path::empty_path())..)
			.take_while(move |(source, _)| *source == usd_path)
			.map(|(_, cache_path)| cache_path)
	}

	pub fn has_dependents(&self, usd_path: &sdf::Path) -> bool {
		self.equal_range(usd_path).next().is_some()
	}

	/// De-duplicated cache paths depending on `subtree_root` or anything below it.
	pub fn gather(&self, subtree_root: &sdf::Path) -> Vec<sdf::Path> {
		let mut affected: Vec<sdf::Path> = self
			.edges
			.range((subtree_root.clone(), sdf::Path::empty_path())..)
			.take_while(|(source, _)| source.has_prefix(subtree_root))
			.map(|(_, cache_path)| cache_path.clone())
			.collect();
		affected.sort();
		affected.dedup();
		affected
	}

	/// Drop the single edge from `usd_path` to `cache_path`.
	pub fn remove(&mut self, usd_path: &sdf::Path, cache_path: &sdf::Path) {
		if !self.edges.remove(&(usd_path.clone(), cache_path.clone())) {
			return;
		}
		if let Some(sources) = self.by_cache_path.get_mut(cache_path) {
			sources.retain(|source| source != usd_path);
			if sources.is_empty() {
				self.by_cache_path.remove(cache_path);
			}
		}
	}

	/// Drop every edge targeting `cache_path`.
	pub fn remove_cache_path(&mut self, cache_path: &sdf::Path) {
		if let Some(sources) = self.by_cache_path.remove(cache_path) {
			for source in sources {
				self.edges.remove(&(source, cache_path.clone()));
			}
		}
	}

	/// Drop edges whose cache path is no longer live. Returns the number of edges removed.
	pub fn garbage_collect(&mut self, is_live: impl Fn(&sdf::Path) -> bool) -> usize {
		let stale: Vec<sdf::Path> = self
			.by_cache_path
			.keys()
			.filter(|cache_path| !is_live(cache_path))
			.cloned()
			.collect();

		let before = self.edges.len();
		for cache_path in &stale {
			self.remove_cache_path(cache_path);
		}
		before - self.edges.len()
	}

	pub fn len(&self) -> usize {
		self.edges.len()
	}

	pub fn is_empty(&self) -> bool {
		self.edges.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &(sdf::Path, sdf::Path)> {
		self.edges.iter()
	}

	/// All edges in order, for comparing index states.
	pub fn snapshot(&self) -> Vec<(sdf::Path, sdf::Path)> {
		self.edges.iter().cloned().collect()
	}
}
