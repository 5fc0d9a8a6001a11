use openusd_imaging::hd::{MemoryRenderIndex, PrimKind};
use openusd_imaging::usd_imaging::{AdapterRegistry, Delegate, DelegateConfig, InstanceAdapter};
use openusd_imaging::{sdf, tf, usd, usd_geom, vt};
use std::sync::Arc;

fn p(s: &str) -> sdf::Path {
	sdf::Path::from(s)
}

/// `/World/A` and `/World/B` instancing `/__Proto_1`, a single mesh.
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

fn populated(stage: &Arc<usd::Stage>) -> (Delegate<MemoryRenderIndex>, Arc<InstanceAdapter>) {
	let _ = env_logger::builder().is_test(true).try_init();
	let adapter = Arc::new(InstanceAdapter::new());
	let registry = AdapterRegistry::with_builtin_instancing(adapter.clone());
	let mut delegate =
		Delegate::with_registry(stage.clone(), MemoryRenderIndex::new(), registry, DelegateConfig::default()).unwrap();
	delegate.populate("/World").unwrap();
	delegate.sync_all();
	(delegate, adapter)
}

#[test]
fn shared_prototype_draws_through_one_instancer() {
	let stage = two_instances();
	let (delegate, adapter) = populated(&stage);
	let index = delegate.render_index();

	assert_eq!(adapter.instancers(), vec![p("/World/A")]);
	assert_eq!(index.instancer_ids(), vec![p("/World/A")]);
	assert_eq!(index.rprim_ids(), vec![p("/World/A.proto_Mesh_id0")]);
	assert_eq!(
		index.entry(PrimKind::Rprim, &p("/World/A.proto_Mesh_id0")).map(|entry| entry.instancer_id.clone()),
		Some(p("/World/A"))
	);

	let prototype = p("/World/A.proto_Mesh_id0");
	assert_eq!(delegate.get_instancer_prototypes(&p("/World/A")), vec![prototype.clone()]);
	assert_eq!(delegate.get_instancer_id(&prototype), p("/World/A"));
	assert_eq!(delegate.get_instance_indices(&p("/World/A"), &prototype), vec![0, 1]);
	assert_eq!(delegate.get_scene_prim_path(&prototype, 1), p("/World/B/Mesh"));
}

#[test]
fn hiding_an_instance_reclassifies_only_that_instance() {
	let stage = two_instances();
	let (mut delegate, adapter) = populated(&stage);
	let prototype = p("/World/A.proto_Mesh_id0");
	assert_eq!(delegate.get_instance_indices(&p("/World/A"), &prototype), vec![0, 1]);
	let evaluations = adapter.visibility_evaluations();

	stage.set_attribute("/World/B.visibility", usd_geom::TOKENS.invisible.clone()).unwrap();
	delegate.apply_pending_updates();

	assert_eq!(delegate.get_instance_indices(&p("/World/A"), &prototype), vec![0]);
	assert_eq!(adapter.visibility_evaluations(), evaluations + 1);

	delegate.set_time(10.0);
	assert_eq!(delegate.get_instance_indices(&p("/World/A"), &prototype), vec![0]);
	assert_eq!(adapter.visibility_evaluations(), evaluations + 1);
}

#[test]
fn nested_prototypes_draw_once_per_outer_instance() {
	let stage = usd::Stage::new();
	stage.define_prototype("/__Proto_2").unwrap();
	stage.define_prim("/__Proto_2/Mesh", "Mesh").unwrap();
	stage.define_prototype("/__Proto_1").unwrap();
	stage.define_prim("/__Proto_1/Inner", "Xform").unwrap();
	stage.set_instance("/__Proto_1/Inner", "/__Proto_2").unwrap();
	let outer = ["/World/A", "/World/B", "/World/C"];
	for instance in outer {
		stage.define_prim(instance, "Xform").unwrap();
		stage.set_instance(instance, "/__Proto_1").unwrap();
	}

	let (delegate, adapter) = populated(&stage);
	let inner = p("/__Proto_1/Inner");
	assert_eq!(adapter.instance_count(&stage, &inner), outer.len());

	let drawn = adapter.instance_contexts(&stage, &inner, |contexts| contexts.count());
	assert_eq!(drawn, outer.len());

	let prototype = p("/__Proto_1/Inner.proto_Mesh_id0");
	assert_eq!(delegate.get_instance_indices(&inner, &prototype), vec![0, 1, 2]);
	assert_eq!(delegate.get_scene_prim_path(&prototype, 2), p("/World/C/Inner/Mesh"));
	// Nested instancers are flattened: they draw every expansion themselves.
	assert_eq!(delegate.get_instancer_id(&inner), sdf::Path::empty_path());
}

#[test]
fn binding_a_material_moves_the_instance_to_its_own_bucket() {
	let stage = two_instances();
	stage.define_prim("/Looks/Red", "Material").unwrap();
	let (mut delegate, adapter) = populated(&stage);
	assert_eq!(adapter.instancers(), vec![p("/World/A")]);

	stage.set_attribute("/World/B.material:binding", p("/Looks/Red")).unwrap();
	delegate.apply_pending_updates();
	delegate.sync_all();

	assert_eq!(adapter.instancers(), vec![p("/World/A"), p("/World/B")]);
	assert_eq!(
		delegate.render_index().instancer_ids(),
		vec![p("/World/A"), p("/World/B")]
	);
	assert_eq!(delegate.get_instance_indices(&p("/World/A"), &p("/World/A.proto_Mesh_id0")), vec![0]);
	assert_eq!(delegate.get_instance_indices(&p("/World/B"), &p("/World/B.proto_Mesh_id0")), vec![0]);
	assert_eq!(delegate.get_material_id(&p("/World/B.proto_Mesh_id0")), p("/Looks/Red"));
	assert_eq!(delegate.get_material_id(&p("/World/A.proto_Mesh_id0")), sdf::Path::empty_path());
}

#[test]
fn instance_transforms_follow_the_instances() {
	let stage = two_instances();
	stage.set_attribute("/World/B.xformOp:translate", glam::DVec3::new(0.0, 3.0, 0.0)).unwrap();
	stage
		.set_attribute("/World/B.xformOpOrder", vec![tf::Token::new("xformOp:translate")])
		.unwrap();
	let (delegate, _) = populated(&stage);

	let transforms = delegate
		.get(&p("/World/A"), &openusd_imaging::hd::TOKENS.instance_transform)
		.and_then(|value| value.get::<vt::Array<glam::DMat4>>())
		.unwrap();
	assert_eq!(transforms.len(), 2);
	assert_eq!(transforms[0], glam::DMat4::IDENTITY);
	assert_eq!(transforms[1].w_axis.y, 3.0);
}

#[test]
fn removing_the_prototype_user_tears_down_the_instancer() {
	let stage = two_instances();
	let (mut delegate, adapter) = populated(&stage);

	stage.remove_prim("/World/A").unwrap();
	delegate.apply_pending_updates();

	assert_eq!(adapter.instancers(), vec![p("/World/B")]);
	assert_eq!(delegate.render_index().instancer_ids(), vec![p("/World/B")]);
	assert_eq!(delegate.render_index().rprim_ids(), vec![p("/World/B.proto_Mesh_id0")]);
	assert_eq!(
		delegate.get_instance_indices(&p("/World/B"), &p("/World/B.proto_Mesh_id0")),
		vec![0]
	);
}

/// `/__Proto_1/Inner` instancing `/__Proto_2`, a single mesh, below each of
/// the outer instances.
fn nested_instances(outer: &[&str]) -> Arc<usd::Stage> {
	let stage = usd::Stage::new();
	stage.define_prototype("/__Proto_2").unwrap();
	stage.define_prim("/__Proto_2/Mesh", "Mesh").unwrap();
	stage.define_prototype("/__Proto_1").unwrap();
	stage.define_prim("/__Proto_1/Inner", "Xform").unwrap();
	stage.set_instance("/__Proto_1/Inner", "/__Proto_2").unwrap();
	for instance in outer {
		stage.define_prim(*instance, "Xform").unwrap();
		stage.set_instance(*instance, "/__Proto_1").unwrap();
	}
	stage
}

#[test]
fn outer_instances_in_separate_buckets_share_the_nested_instancer() {
	let stage = nested_instances(&["/World/A", "/World/C"]);
	stage.set_attribute("/World/C.purpose", usd_geom::TOKENS.proxy.clone()).unwrap();
	let (delegate, adapter) = populated(&stage);
	let index = delegate.render_index();

	let inner = p("/__Proto_1/Inner");
	assert_eq!(adapter.instancers(), vec![p("/World/A"), p("/World/C"), inner.clone()]);
	assert_eq!(index.instancer_ids(), vec![p("/World/A"), p("/World/C"), inner.clone()]);
	assert_eq!(index.rprim_ids(), vec![p("/__Proto_1/Inner.proto_Mesh_id0")]);
	assert_eq!(index.insert_count(), 4);

	assert_eq!(adapter.instance_count(&stage, &inner), 2);
	let prototype = p("/__Proto_1/Inner.proto_Mesh_id0");
	assert_eq!(delegate.get_instance_indices(&inner, &prototype), vec![0, 1]);
	assert_eq!(delegate.get_scene_prim_path(&prototype, 1), p("/World/C/Inner/Mesh"));
}

#[test]
fn instance_purpose_reaches_prototype_geometry() {
	let stage = two_instances();
	stage.set_attribute("/World/B.purpose", usd_geom::TOKENS.proxy.clone()).unwrap();
	let (delegate, adapter) = populated(&stage);

	assert_eq!(adapter.instancers(), vec![p("/World/A"), p("/World/B")]);
	assert_eq!(delegate.get_render_tag(&p("/World/B")), usd_geom::TOKENS.proxy);
	assert_eq!(delegate.get_render_tag(&p("/World/B.proto_Mesh_id0")), usd_geom::TOKENS.proxy);
	assert_eq!(delegate.get_render_tag(&p("/World/A.proto_Mesh_id0")), usd_geom::TOKENS.default_);

	// A purpose authored inside the prototype wins over the instance's.
	let stage = two_instances();
	stage.set_attribute("/World/B.purpose", usd_geom::TOKENS.proxy.clone()).unwrap();
	stage.set_attribute("/__Proto_1/Mesh.purpose", tf::Token::new("render")).unwrap();
	let (delegate, _) = populated(&stage);
	assert_eq!(delegate.get_render_tag(&p("/World/B.proto_Mesh_id0")), "render");
}

#[test]
fn directly_instanced_gprims_draw_nothing() {
	let stage = usd::Stage::new();
	stage.define_prim("/__Proto_1", "Mesh").unwrap();
	stage.define_prototype("/__Proto_1").unwrap();
	stage.define_prim("/World/A", "Xform").unwrap();
	stage.set_instance("/World/A", "/__Proto_1").unwrap();
	let (delegate, adapter) = populated(&stage);

	assert_eq!(adapter.instancers(), vec![p("/World/A")]);
	assert!(delegate.render_index().rprim_ids().is_empty());
	assert!(delegate.get_instancer_prototypes(&p("/World/A")).is_empty());
}

#[test]
fn invising_a_nested_instance_hides_only_its_draw() {
	let stage = nested_instances(&["/World/A", "/World/B", "/World/C"]);
	let (mut delegate, _) = populated(&stage);
	let inner = p("/__Proto_1/Inner");
	let prototype = p("/__Proto_1/Inner.proto_Mesh_id0");

	delegate.set_invised_paths(vec![p("/World/B/Inner")]);
	assert_eq!(delegate.get_instance_indices(&inner, &prototype), vec![0, 2]);

	delegate.set_invised_paths(vec![p("/World/C")]);
	assert_eq!(delegate.get_instance_indices(&inner, &prototype), vec![0, 1]);

	delegate.set_invised_paths(Vec::new());
	assert_eq!(delegate.get_instance_indices(&inner, &prototype), vec![0, 1, 2]);
}
