use openusd_imaging::hd::{MemoryRenderIndex, PrimKind};
use openusd_imaging::usd_imaging::{Delegate, DelegateConfig, SyncState};
use openusd_imaging::{sdf, tf, usd, usd_geom};
use std::sync::Arc;

fn p(s: &str) -> sdf::Path {
	sdf::Path::from(s)
}

fn scene() -> Arc<usd::Stage> {
	let stage = usd::Stage::new();
	stage.define_prim("/World", "Xform").unwrap();
	stage.define_prim("/World/Group", "Xform").unwrap();
	stage.define_prim("/World/Group/Cube", "Cube").unwrap();
	stage.define_prim("/World/Group/Ball", "Sphere").unwrap();
	stage.define_prim("/World/Sun", "DistantLight").unwrap();
	stage.define_prim("/Looks/Red", "Material").unwrap();
	stage.set_attribute("/World/Group/Cube.material:binding", p("/Looks/Red")).unwrap();
	stage
}

fn populated(stage: &Arc<usd::Stage>) -> Delegate<MemoryRenderIndex> {
	let _ = env_logger::builder().is_test(true).try_init();
	let mut delegate = Delegate::new(stage.clone(), MemoryRenderIndex::new(), DelegateConfig::default()).unwrap();
	delegate.populate("/").unwrap();
	delegate.sync_all();
	delegate
}

#[test]
fn population_reaches_every_adapter() {
	let stage = scene();
	let delegate = populated(&stage);
	let index = delegate.render_index();

	assert_eq!(index.rprim_ids(), vec![p("/World/Group/Ball"), p("/World/Group/Cube")]);
	assert_eq!(index.sprim_ids(), vec![p("/Looks/Red"), p("/World/Sun")]);
	assert_eq!(delegate.get_material_id(&p("/World/Group/Cube")), p("/Looks/Red"));
	assert!(!delegate.get_extent(&p("/World/Group/Cube")).is_empty());
	assert!(delegate.get_topology(&p("/World/Group/Cube")).is_none());
}

#[test]
fn dependencies_cover_every_ancestor() {
	let stage = scene();
	let delegate = populated(&stage);

	for (cache_path, info) in delegate.prim_info().iter() {
		let usd_path = &info.usd_path;
		for ancestor in usd_path.prefixes() {
			assert!(
				delegate.dependencies().gather(&ancestor).contains(cache_path),
				"<{cache_path}> missing below <{ancestor}>"
			);
		}
	}
}

#[test]
fn repeated_resync_is_idempotent() {
	let stage = scene();
	let mut delegate = populated(&stage);

	stage.set_active("/World/Group", false).unwrap();
	stage.set_active("/World/Group", true).unwrap();
	delegate.apply_pending_updates();
	let prims = delegate.prim_info().snapshot();
	let dependencies = delegate.dependencies().snapshot();

	stage.set_active("/World/Group", false).unwrap();
	stage.set_active("/World/Group", true).unwrap();
	delegate.apply_pending_updates();
	assert_eq!(delegate.prim_info().snapshot(), prims);
	assert_eq!(delegate.dependencies().snapshot(), dependencies);
	assert_eq!(delegate.sync_state(), SyncState::Clean);
}

#[test]
fn deleted_prims_leave_no_trace() {
	let stage = scene();
	let mut delegate = populated(&stage);

	stage.remove_prim("/World/Group/Ball").unwrap();
	delegate.apply_pending_updates();

	assert!(!delegate.render_index().contains(PrimKind::Rprim, &p("/World/Group/Ball")));
	assert!(!delegate.prim_info().contains(&p("/World/Group/Ball")));
	assert!(delegate.dependencies().iter().all(|(_, cache_path)| delegate.prim_info().contains(cache_path)));
	assert!(delegate.render_index().contains(PrimKind::Rprim, &p("/World/Group/Cube")));
}

#[test]
fn value_edits_dirty_without_repopulating() {
	let stage = scene();
	stage.set_attribute("/World/Group.visibility", usd_geom::TOKENS.inherited.clone()).unwrap();
	let mut delegate = populated(&stage);
	delegate.render_index_mut().mark_all_clean();
	let inserts = delegate.render_index().insert_count();

	stage.set_attribute("/World/Group.visibility", usd_geom::TOKENS.invisible.clone()).unwrap();
	delegate.apply_pending_updates();

	assert_eq!(delegate.render_index().insert_count(), inserts);
	for mesh in ["/World/Group/Cube", "/World/Group/Ball"] {
		let bits = delegate.render_index().dirty_bits(PrimKind::Rprim, &p(mesh));
		assert!(bits.contains(openusd_imaging::hd::DirtyBits::VISIBILITY), "{mesh}: {bits:?}");
	}

	delegate.sync_all();
	assert!(!delegate.get_visible(&p("/World/Group/Cube")));
}

#[test]
fn rebinding_a_material_resyncs_the_gprim() {
	let stage = scene();
	stage.define_prim("/Looks/Blue", "Material").unwrap();
	let mut delegate = populated(&stage);

	stage.set_attribute("/World/Group/Cube.material:binding", p("/Looks/Blue")).unwrap();
	delegate.apply_pending_updates();
	delegate.sync_all();

	assert_eq!(delegate.get_material_id(&p("/World/Group/Cube")), p("/Looks/Blue"));
	assert!(delegate.render_index().contains(PrimKind::Sprim, &p("/Looks/Blue")));
}

#[test]
fn batched_edits_apply_in_one_pass() {
	let stage = scene();
	let mut delegate = populated(&stage);

	stage.batch(|stage| {
		stage.define_prim("/World/Group/Points", "Points").unwrap();
		stage.set_metadata("/World/Group", "kind", tf::Token::new("group")).unwrap();
	});
	assert_eq!(delegate.sync_state(), SyncState::CollectingEdits);
	delegate.apply_pending_updates();

	assert!(delegate.render_index().contains(PrimKind::Rprim, &p("/World/Group/Points")));
	assert_eq!(delegate.sync_state(), SyncState::Clean);
}
