//! Population walks and change routing over an [`IndexProxy`].

use super::{IndexProxy, PrimAdapter, TOKENS};
use crate::hd::DirtyBits;
use crate::{sdf, tf, usd, usd_geom, usd_shade};
use std::sync::Arc;

/// The part of the scene a delegate images.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scope<'a> {
	pub root: &'a sdf::Path,
	pub excluded: &'a [sdf::Path],
}

enum Admission {
	Inside,
	/// An ancestor of the root: walk through without populating.
	Above,
	Outside,
}

impl Scope<'_> {
	fn admit(&self, path: &sdf::Path) -> Admission {
		if self.excluded.iter().any(|excluded| path.has_prefix(excluded)) {
			return Admission::Outside;
		}
		if path.has_prefix(self.root) {
			Admission::Inside
		} else if self.root.has_prefix(path) {
			Admission::Above
		} else {
			Admission::Outside
		}
	}
}

/// Return true if nothing below `prim` can be imaged: typed prims that are
/// not imageable, such as materials, are only populated by reference.
pub(crate) fn should_cull_subtree(prim: &usd::Prim) -> bool {
	let type_name = prim.type_name();
	!type_name.is_empty() && !usd_geom::is_imageable_type(&type_name)
}

/// Pre-order walk from `root`. `visit` returns whether to descend.
pub(crate) fn traverse<'a>(root: usd::Prim<'a>, instance_proxies: bool, mut visit: impl FnMut(&usd::Prim<'a>) -> bool) {
	let mut stack = vec![root];
	while let Some(prim) = stack.pop() {
		if !prim.is_active() || !visit(&prim) {
			continue;
		}
		let mut children = prim.filtered_children(instance_proxies);
		children.reverse();
		stack.extend(children);
	}
}

/// Populate every imageable prim below `roots`.
///
/// Prototype subtrees are skipped here; the instance adapter walks them on
/// behalf of their instances.
pub(crate) fn populate(index: &mut IndexProxy, roots: &[sdf::Path], scope: Scope) {
	let stage = index.stage();
	let mut leaves: Vec<(usd::Prim, Arc<dyn PrimAdapter>)> = Vec::new();
	let mut uninstanced: Vec<usd::Prim> = Vec::new();

	for root in roots {
		let Some(root_prim) = stage.prim_at_path(root) else {
			log::debug!(target: "usd_imaging::changes", "Skipping population of <{root}>: prim is gone");
			continue;
		};
		if root_prim.is_in_prototype() {
			log::debug!(target: "usd_imaging::changes", "Skipping population of prototype prim <{root}>");
			continue;
		}

		traverse(root_prim, false, |prim| {
			match scope.admit(prim.path()) {
				Admission::Outside => return false,
				Admission::Above => return true,
				Admission::Inside => {}
			}
			if should_cull_subtree(prim) {
				log::trace!(target: "usd_imaging::changes", "Pruning <{}> by type {}", prim.path(), prim.type_name());
				return false;
			}
			if prim.is_instance()
				&& index
					.adapter_for(prim, true)
					.is_some_and(|adapter| adapter.should_ignore_native_instance_subtrees())
			{
				uninstanced.push(prim.clone());
				return false;
			}
			match index.adapter_for(prim, false) {
				Some(adapter) if adapter.should_ignore_native_instance_subtrees() => {
					uninstanced.push(prim.clone());
					false
				}
				Some(adapter) => {
					let descend = !adapter.should_cull_children();
					leaves.push((prim.clone(), adapter));
					descend
				}
				None => true,
			}
		});
	}

	for root_prim in uninstanced {
		traverse(root_prim, true, |prim| {
			if !matches!(scope.admit(prim.path()), Admission::Inside) || should_cull_subtree(prim) {
				return false;
			}
			match index.adapter_for(prim, true) {
				Some(adapter) => {
					let descend = !adapter.should_cull_children();
					leaves.push((prim.clone(), adapter));
					descend
				}
				None => true,
			}
		});
	}

	if leaves.is_empty() {
		return;
	}
	log::debug!(target: "usd_imaging::changes", "Populating {} prims", leaves.len());
	for (prim, adapter) in leaves {
		adapter.populate(&prim, index, None);
	}
}

/// Route a structural change of the prim at `usd_path`.
///
/// A populated prim at or above the path is resynced by its adapter and
/// owns the change. Otherwise populated prims below the path are resynced
/// and the subtree is searched for prims not yet populated; a subtree with
/// nothing populated is populated from scratch.
pub(crate) fn resync_prim(index: &mut IndexProxy, usd_path: &sdf::Path, repopulate_from_root: bool) {
	log::debug!(target: "usd_imaging::changes", "Resync prim <{usd_path}>");

	let mut found_owner = false;
	let mut current = usd_path.clone();
	while !found_owner && !current.is_absolute_root() && !current.is_empty() {
		let dependents: Vec<sdf::Path> = index.dependencies().equal_range(&current).cloned().collect();
		for cache_path in dependents {
			let Some(adapter) = index.prim_info().get(&cache_path).map(|info| info.adapter.clone()) else {
				continue;
			};
			log::debug!(target: "usd_imaging::changes", "  affected prim <{cache_path}>");
			adapter.process_prim_resync(&cache_path, index);
			found_owner = true;
		}
		current = current.parent_path();
	}

	let affected = index.dependencies().gather(usd_path);
	if !affected.is_empty() {
		if found_owner {
			return;
		}
		for cache_path in &affected {
			let Some(adapter) = index.prim_info().get(cache_path).map(|info| info.adapter.clone()) else {
				continue;
			};
			log::debug!(target: "usd_imaging::changes", "  affected child prim <{cache_path}>");
			adapter.process_prim_resync(cache_path, index);
		}

		if repopulate_from_root {
			index.repopulate(usd_path);
			return;
		}

		let stage = index.stage();
		let Some(prim) = stage.prim_at_path(usd_path) else {
			return;
		};
		let mut new_roots = Vec::new();
		traverse(prim, false, |prim| {
			if index.dependencies().has_dependents(prim.path()) || should_cull_subtree(prim) {
				return false;
			}
			if index.adapter_for(prim, false).is_some() {
				new_roots.push(prim.path().clone());
				return false;
			}
			true
		});
		for root in &new_roots {
			log::debug!(target: "usd_imaging::changes", "  new prim <{root}>");
			index.repopulate(root);
		}
		return;
	}

	if index.stage().is_valid(usd_path) {
		log::debug!(target: "usd_imaging::changes", "  new subtree <{usd_path}>");
		index.repopulate(usd_path);
	} else {
		log::debug!(target: "usd_imaging::changes", "  deleted prim <{usd_path}>");
	}
}

/// Route a value change of the object at `usd_path`. `changed_fields` names
/// the metadata fields touched by a prim-level edit.
pub(crate) fn refresh_object(index: &mut IndexProxy, usd_path: &sdf::Path, changed_fields: &[tf::Token]) {
	log::debug!(target: "usd_imaging::changes", "Refresh <{usd_path}> {changed_fields:?}");

	let affected: Vec<sdf::Path> = if usd_path.is_absolute_root_or_prim_path() {
		populated_dependents(index, usd_path)
	} else if usd_path.is_property_path() {
		let prim_path = usd_path.prim_path();
		let name = usd_path.name_token();

		if name == usd_geom::TOKENS.model_draw_mode || usd_shade::MaterialBindingApi::can_contain_property_name(&name) {
			resync_prim(index, &prim_path, true);
			return;
		}

		if name == usd_geom::TOKENS.visibility
			|| name == usd_geom::TOKENS.purpose
			|| usd_geom::XformOp::is_transformation_affected_by_attr_named(&name)
			|| name.as_str().starts_with(TOKENS.primvars_prefix.as_str())
		{
			index.dependencies().gather(&prim_path)
		} else {
			match index.stage().prim_at_path(&prim_path) {
				Some(prim) if prim.type_name() == TOKENS.shader => match usd_shade::Material::enclosing(&prim) {
					Some(material) => {
						log::debug!(
							target: "usd_imaging::changes",
							"Shader property <{usd_path}> modified; updating material <{}>",
							material.prim().path()
						);
						populated_dependents(index, material.prim().path())
					}
					None => Vec::new(),
				},
				_ => populated_dependents(index, &prim_path),
			}
		}
	} else {
		log::warn!("Ignoring refresh of unexpected path <{usd_path}>");
		return;
	};

	let stage = index.stage();
	for cache_path in affected {
		let Some((prim_path, adapter)) = index
			.prim_info()
			.get(&cache_path)
			.map(|info| (info.usd_path.clone(), info.adapter.clone()))
		else {
			continue;
		};
		let Some(prim) = stage.prim_at_path(&prim_path) else {
			continue;
		};

		let dirty = if usd_path.is_property_path() {
			adapter.process_property_change(&prim, &cache_path, usd_path)
		} else {
			adapter.process_prim_change(&prim, &cache_path, changed_fields)
		};

		if dirty.is_all_dirty() {
			resync_prim(index, &prim_path, false);
		} else if !dirty.is_clean() {
			let time_varying = index.retrack_variability(&prim, &cache_path);
			let combined: DirtyBits = dirty | time_varying;
			if !combined.is_clean() {
				adapter.mark_dirty(&prim, &cache_path, combined, index);
			}
		}
	}
}

fn populated_dependents(index: &IndexProxy, usd_path: &sdf::Path) -> Vec<sdf::Path> {
	index
		.dependencies()
		.equal_range(usd_path)
		.filter(|cache_path| index.is_populated(cache_path))
		.cloned()
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hd::MemoryRenderIndex;
	use crate::usd_imaging::index_proxy::Bookkeeping;
	use crate::usd_imaging::{AdapterRegistry, DelegateConfig, QueryContext};

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	fn scene() -> std::sync::Arc<usd::Stage> {
		let stage = usd::Stage::new();
		stage.define_prim("/World/Geom/Mesh", "Mesh").unwrap();
		stage.define_prim("/World/Geom/Cube", "Cube").unwrap();
		stage.define_prim("/World/Looks/Red", "Material").unwrap();
		stage.define_prim("/World/Looks/Red/Surface", "Shader").unwrap();
		stage.define_prim("/World/Proxy/Mesh", "Mesh").unwrap();
		stage
	}

	#[test]
	fn walk_prunes_excluded_and_non_imageable_prims() {
		let stage = scene();
		let registry = AdapterRegistry::with_builtin();
		let config = DelegateConfig::default();
		let mut render_index = MemoryRenderIndex::new();
		let mut book = Bookkeeping::default();
		let root = p("/World");
		let excluded = [p("/World/Proxy")];

		let mut index = IndexProxy::new(
			&stage,
			&registry,
			&config,
			QueryContext::new(usd::TimeCode::DEFAULT, &[]),
			&mut render_index,
			&mut book,
		);
		populate(&mut index, &[p("/")], Scope { root: &root, excluded: &excluded });
		drop(index);

		assert_eq!(render_index.rprim_ids(), vec![p("/World/Geom/Cube"), p("/World/Geom/Mesh")]);
		assert!(render_index.sprim_ids().is_empty());
	}

	#[test]
	fn resync_of_new_subtree_queues_repopulation() {
		let stage = scene();
		let registry = AdapterRegistry::with_builtin();
		let config = DelegateConfig::default();
		let mut render_index = MemoryRenderIndex::new();
		let mut book = Bookkeeping::default();
		let root = p("/");

		let mut index = IndexProxy::new(
			&stage,
			&registry,
			&config,
			QueryContext::new(usd::TimeCode::DEFAULT, &[]),
			&mut render_index,
			&mut book,
		);
		populate(&mut index, &[p("/World/Geom")], Scope { root: &root, excluded: &[] });

		stage.define_prim("/World/Geom/Points", "Points").unwrap();
		resync_prim(&mut index, &p("/World/Geom/Points"), false);
		assert_eq!(index.take_paths_to_repopulate(), vec![p("/World/Geom/Points")]);

		resync_prim(&mut index, &p("/World/Gone"), false);
		assert!(index.take_paths_to_repopulate().is_empty());

		resync_prim(&mut index, &p("/World/Geom"), false);
		index.process_removals();
		assert_eq!(
			index.take_paths_to_repopulate(),
			vec![p("/World/Geom/Cube"), p("/World/Geom/Mesh"), p("/World/Geom/Points")]
		);
		assert!(!index.is_populated(&p("/World/Geom/Mesh")));
	}
}
