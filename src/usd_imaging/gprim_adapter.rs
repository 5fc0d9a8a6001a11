use super::{
	GPRIM_TYPES, IndexProxy, InstancerContext, PrimAdapter, QueryContext, TOKENS, ValueCache, extent_attribute,
	material_usd_path, primvar_property_change, resolve_cache_path,
};
use crate::hd::{self, DirtyBits};
use crate::{sdf, tf, usd, usd_geom, usd_shade, vt};
use glam::DVec3;

/// Adapter for geometric prims: meshes, curves, points and implicit shapes.
///
/// Every gprim becomes one rprim. Materials bound to the gprim or to its
/// geometry subsets are populated by reference.
#[derive(Debug, Default)]
pub struct GprimAdapter;

impl GprimAdapter {
	pub fn new() -> Self {
		Self
	}

	fn rprim_type(type_name: &tf::Token) -> Option<tf::Token> {
		GPRIM_TYPES
			.iter()
			.find(|(schema, _)| type_name == *schema)
			.map(|(_, rprim)| tf::Token::new(rprim))
	}

	fn add_rprim(
		&self,
		rprim_type: &tf::Token,
		prim: &usd::Prim,
		index: &mut IndexProxy,
		material_path: &sdf::Path,
		instancer_context: Option<&InstancerContext>,
	) -> sdf::Path {
		let cache_path = resolve_cache_path(prim.path(), instancer_context);
		let stage = index.stage();
		let Some(proxy_prim) = stage.prim_at_path(cache_path.prim_path()) else {
			super::diagnostic::coding_error!("No prim at <{}> for rprim <{cache_path}>", cache_path.prim_path());
			return sdf::Path::empty_path();
		};

		index.insert_rprim(rprim_type, &cache_path, &proxy_prim, instancer_context);
		if !index.is_populated(&cache_path) {
			return sdf::Path::empty_path();
		}
		if instancer_context.is_some() {
			// Prototype rprims are keyed on the prototype prim, not the instancer.
			index.remove_prim_info_dependency(&cache_path);
			index.add_dependency(&cache_path, prim);
		}

		let material_path = match instancer_context {
			Some(ctx) => &ctx.instancer_material_usd_path,
			None => material_path,
		};
		populate_material(index, &cache_path, prim, material_path);

		for subset in material_subsets(prim) {
			index.add_dependency(&cache_path, &subset);
			if let Some(subset_material) = usd_shade::MaterialBindingApi::new(&subset).direct_binding() {
				populate_material(index, &cache_path, prim, &subset_material);
			}
		}

		cache_path
	}
}

/// Populate the material at `material_path` and make `cache_path` depend on it.
fn populate_material(index: &mut IndexProxy, cache_path: &sdf::Path, prim: &usd::Prim, material_path: &sdf::Path) {
	if material_path.is_empty() {
		return;
	}
	let stage = index.stage();
	let Some(material_prim) = stage.prim_at_path(material_path.prim_path()) else {
		return;
	};
	if material_prim.type_name() != TOKENS.material {
		log::warn!(
			"Gprim <{}> has illegal material reference to prim <{}> of type ({})",
			prim.path(),
			material_prim.path(),
			material_prim.type_name()
		);
		return;
	}
	if let Some(material_adapter) = index.material_adapter() {
		material_adapter.populate(&material_prim, index, None);
		index.add_dependency(cache_path, &material_prim);
	}
}

/// Geometry subsets below `prim` that carry their own material binding.
fn material_subsets<'a>(prim: &usd::Prim<'a>) -> Vec<usd::Prim<'a>> {
	prim.children()
		.into_iter()
		.filter(|child| child.type_name() == TOKENS.geom_subset)
		.filter(|child| {
			child
				.attribute(&TOKENS.family_name)
				.get_typed::<tf::Token>(usd::TimeCode::DEFAULT)
				.is_none_or(|family| family == TOKENS.material_bind)
		})
		.collect()
}

fn might_vary(prim: &usd::Prim, names: &[&tf::Token]) -> bool {
	names.iter().any(|name| prim.attribute(name).might_be_time_varying())
}

fn mesh_topology(prim: &usd::Prim, time: usd::TimeCode) -> hd::MeshTopology {
	let ints = |name: &tf::Token| {
		prim.attribute(name)
			.get_typed::<vt::Array<i32>>(time)
			.unwrap_or_default()
	};
	let token_or = |name: &tf::Token, fallback: &str| {
		prim.attribute(name)
			.get_typed::<tf::Token>(usd::TimeCode::DEFAULT)
			.unwrap_or_else(|| tf::Token::new(fallback))
	};

	let geom_subsets = material_subsets(prim)
		.iter()
		.map(|subset| hd::GeomSubset {
			id: subset.path().clone(),
			material_id: usd_shade::MaterialBindingApi::new(subset)
				.direct_binding()
				.unwrap_or_default(),
			indices: subset
				.attribute(&TOKENS.indices)
				.get_typed::<vt::Array<i32>>(time)
				.unwrap_or_default(),
		})
		.collect();

	hd::MeshTopology {
		scheme: token_or(&usd_geom::TOKENS.subdivision_scheme, "catmullClark"),
		orientation: token_or(&usd_geom::TOKENS.orientation, "rightHanded"),
		face_vertex_counts: ints(&usd_geom::TOKENS.face_vertex_counts),
		face_vertex_indices: ints(&usd_geom::TOKENS.face_vertex_indices),
		hole_indices: ints(&usd_geom::TOKENS.hole_indices),
		geom_subsets,
	}
}

fn curves_topology(prim: &usd::Prim, time: usd::TimeCode) -> hd::BasisCurvesTopology {
	let token_or = |name: &tf::Token, fallback: &str| {
		prim.attribute(name)
			.get_typed::<tf::Token>(usd::TimeCode::DEFAULT)
			.unwrap_or_else(|| tf::Token::new(fallback))
	};
	hd::BasisCurvesTopology {
		curve_type: token_or(&usd_geom::TOKENS.curve_type, "cubic"),
		basis: token_or(&usd_geom::TOKENS.basis, "bezier"),
		wrap: token_or(&usd_geom::TOKENS.wrap, "nonperiodic"),
		curve_vertex_counts: prim
			.attribute(&usd_geom::TOKENS.curve_vertex_counts)
			.get_typed::<vt::Array<i32>>(time)
			.unwrap_or_default(),
	}
}

fn scalar(prim: &usd::Prim, name: &tf::Token, time: usd::TimeCode) -> Option<f64> {
	let value = prim.attribute(name).get(time)?;
	value.get::<f64>().or_else(|| value.get::<f32>().map(f64::from))
}

/// Bounds of implicit shapes from their size parameters.
fn implicit_extent(prim: &usd::Prim, time: usd::TimeCode) -> Option<hd::Range3d> {
	let half = match prim.type_name().as_str() {
		"Cube" => DVec3::splat(scalar(prim, &usd_geom::TOKENS.size, time).unwrap_or(2.0) / 2.0),
		"Sphere" => DVec3::splat(scalar(prim, &usd_geom::TOKENS.radius, time).unwrap_or(1.0)),
		"Cylinder" | "Cone" | "Capsule" => {
			let radius = scalar(prim, &usd_geom::TOKENS.radius, time).unwrap_or(1.0);
			let mut half_height = scalar(prim, &usd_geom::TOKENS.height, time).unwrap_or(2.0) / 2.0;
			if prim.type_name() == "Capsule" {
				half_height += radius;
			}
			let axis = prim
				.attribute(&usd_geom::TOKENS.axis)
				.get_typed::<tf::Token>(usd::TimeCode::DEFAULT)
				.unwrap_or_else(|| tf::Token::new("Z"));
			match axis.as_str() {
				"X" => DVec3::new(half_height, radius, radius),
				"Y" => DVec3::new(radius, half_height, radius),
				_ => DVec3::new(radius, radius, half_height),
			}
		}
		_ => return None,
	};
	Some(hd::Range3d::new(-half, half))
}

const POINTS_ATTRS: [&str; 3] = ["points", "velocities", "accelerations"];
const TOPOLOGY_ATTRS: [&str; 8] = [
	"faceVertexCounts",
	"faceVertexIndices",
	"holeIndices",
	"subdivisionScheme",
	"orientation",
	"curveVertexCounts",
	"basis",
	"wrap",
];
const SHAPE_ATTRS: [&str; 4] = ["size", "radius", "height", "axis"];

impl PrimAdapter for GprimAdapter {
	fn name(&self) -> &'static str {
		"gprim"
	}

	fn populate(
		&self,
		prim: &usd::Prim,
		index: &mut IndexProxy,
		instancer_context: Option<&InstancerContext>,
	) -> sdf::Path {
		let Some(rprim_type) = Self::rprim_type(&prim.type_name()) else {
			super::diagnostic::coding_error!("Gprim adapter cannot image <{}> of type {}", prim.path(), prim.type_name());
			return sdf::Path::empty_path();
		};
		self.add_rprim(&rprim_type, prim, index, &material_usd_path(prim), instancer_context)
	}

	fn track_variability(
		&self,
		prim: &usd::Prim,
		_cache_path: &sdf::Path,
		_query: &QueryContext,
		time_varying_bits: &mut DirtyBits,
	) {
		let tokens = &usd_geom::TOKENS;
		if usd_geom::transform_might_be_time_varying(prim) {
			*time_varying_bits |= DirtyBits::TRANSFORM;
		}
		if usd_geom::visibility_might_be_time_varying(prim) {
			*time_varying_bits |= DirtyBits::VISIBILITY;
		}
		if might_vary(prim, &[&tokens.points, &tokens.velocities, &tokens.accelerations]) {
			*time_varying_bits |= DirtyBits::POINTS;
		}
		if might_vary(prim, &[&tokens.size, &tokens.radius, &tokens.height]) {
			*time_varying_bits |= DirtyBits::POINTS | DirtyBits::EXTENT;
		}
		if might_vary(prim, &[&tokens.extent]) {
			*time_varying_bits |= DirtyBits::EXTENT;
		}
		if might_vary(prim, &[&tokens.normals]) {
			*time_varying_bits |= DirtyBits::NORMALS;
		}
		if might_vary(prim, &[&tokens.widths]) {
			*time_varying_bits |= DirtyBits::WIDTHS;
		}
		if might_vary(
			prim,
			&[&tokens.face_vertex_counts, &tokens.face_vertex_indices, &tokens.curve_vertex_counts],
		) {
			*time_varying_bits |= DirtyBits::TOPOLOGY;
		}

		let api = usd_geom::PrimvarsApi::new(prim);
		if api
			.primvars()
			.iter()
			.chain(api.find_inheritable_primvars().iter())
			.any(|primvar| primvar.attr.might_be_time_varying())
		{
			*time_varying_bits |= DirtyBits::PRIMVAR;
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
		if requested_bits.contains(DirtyBits::TRANSFORM) {
			cache.set_transform(cache_path, self.get_transform(prim, cache_path, query));
		}
		if requested_bits.contains(DirtyBits::VISIBILITY) {
			cache.set_visible(cache_path, self.get_visible(prim, cache_path, query));
		}
		if requested_bits.contains(DirtyBits::TOPOLOGY)
			&& let Some(topology) = self.get_topology(prim, cache_path, query)
		{
			cache.set_topology(cache_path, topology);
		}
		if requested_bits.intersects(DirtyBits::EXTENT | DirtyBits::POINTS) {
			cache.set_extent(cache_path, self.get_extent(prim, cache_path, query));
		}
		if requested_bits.contains(DirtyBits::MATERIAL_ID) {
			cache.set_material_id(cache_path, self.get_material_id(prim, cache_path));
		}
		if requested_bits.contains(DirtyBits::RENDER_TAG) {
			cache.set_value(cache_path, &hd::TOKENS.render_tag, self.get_render_tag(prim, cache_path, None).into());
		}

		let mut keys: Vec<(DirtyBits, &tf::Token)> = vec![
			(DirtyBits::POINTS, &hd::TOKENS.points),
			(DirtyBits::NORMALS, &hd::TOKENS.normals),
			(DirtyBits::WIDTHS, &hd::TOKENS.widths),
			(DirtyBits::DOUBLE_SIDED, &hd::TOKENS.double_sided),
		];
		keys.retain(|(bits, _)| requested_bits.intersects(*bits));
		for (_, key) in keys {
			if let Some(value) = prim.attribute(key).get(query.time) {
				cache.set_value(cache_path, key, value);
			}
		}

		if requested_bits.contains(DirtyBits::PRIMVAR) {
			let names = self.primvar_names(prim, cache_path);
			for name in &names {
				if let Some(value) = self.get(prim, cache_path, name, query) {
					cache.set_value(cache_path, name, value);
				}
			}
			cache.merge_primvar_names(cache_path, names);
		}
	}

	fn process_property_change(&self, prim: &usd::Prim, _cache_path: &sdf::Path, property_path: &sdf::Path) -> DirtyBits {
		let name = property_path.name_token();
		let tokens = &usd_geom::TOKENS;

		if property_path.prim_path() != *prim.path() && name == TOKENS.indices {
			return DirtyBits::TOPOLOGY;
		}

		if name == tokens.visibility {
			DirtyBits::VISIBILITY
		} else if name == tokens.purpose {
			DirtyBits::RENDER_TAG
		} else if usd_geom::XformOp::is_transformation_affected_by_attr_named(&name) {
			DirtyBits::TRANSFORM
		} else if name == tokens.extent {
			DirtyBits::EXTENT
		} else if name == tokens.double_sided {
			DirtyBits::DOUBLE_SIDED
		} else if POINTS_ATTRS.contains(&name.as_str()) {
			DirtyBits::POINTS
		} else if name == tokens.normals {
			DirtyBits::NORMALS
		} else if name == tokens.widths {
			DirtyBits::WIDTHS
		} else if TOPOLOGY_ATTRS.contains(&name.as_str())
			|| (name == tokens.curve_type && prim.type_name() == "BasisCurves")
		{
			DirtyBits::TOPOLOGY
		} else if SHAPE_ATTRS.contains(&name.as_str()) {
			DirtyBits::POINTS | DirtyBits::EXTENT
		} else if usd_shade::MaterialBindingApi::can_contain_property_name(&name) {
			DirtyBits::MATERIAL_ID | DirtyBits::PRIMVAR
		} else {
			primvar_property_change(&name)
		}
	}

	fn remove_prim(&self, cache_path: &sdf::Path, index: &mut IndexProxy) {
		index.remove_rprim(cache_path);
	}

	fn mark_dirty(&self, _prim: &usd::Prim, cache_path: &sdf::Path, dirty: DirtyBits, index: &mut IndexProxy) {
		index.mark_rprim_dirty(cache_path, dirty);
	}

	fn get_topology(&self, prim: &usd::Prim, _cache_path: &sdf::Path, query: &QueryContext) -> Option<hd::Topology> {
		match prim.type_name().as_str() {
			"Mesh" => Some(hd::Topology::Mesh(mesh_topology(prim, query.time))),
			"BasisCurves" => Some(hd::Topology::BasisCurves(curves_topology(prim, query.time))),
			"Points" => {
				let count = prim
					.attribute(&usd_geom::TOKENS.points)
					.get(query.time)
					.map(|points| points.array_len())
					.unwrap_or(0);
				Some(hd::Topology::Points { count })
			}
			_ => None,
		}
	}

	fn get_extent(&self, prim: &usd::Prim, _cache_path: &sdf::Path, query: &QueryContext) -> hd::Range3d {
		let authored = extent_attribute(prim, query.time);
		if !authored.is_empty() {
			return authored;
		}
		implicit_extent(prim, query.time).unwrap_or(authored)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hd::MemoryRenderIndex;
	use crate::usd_imaging::index_proxy::Bookkeeping;
	use crate::usd_imaging::{AdapterRegistry, DelegateConfig};

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	fn t(s: &str) -> tf::Token {
		tf::Token::new(s)
	}

	#[test]
	fn property_changes_map_to_dirty_bits() {
		let stage = usd::Stage::new();
		stage.define_prim("/World/Mesh", "Mesh").unwrap();
		let mesh = stage.prim_at_path("/World/Mesh").unwrap();
		let adapter = GprimAdapter::new();
		let change = |path: &str| adapter.process_property_change(&mesh, mesh.path(), &p(path));

		assert_eq!(change("/World/Mesh.points"), DirtyBits::POINTS);
		assert_eq!(change("/World/Mesh.xformOp:translate"), DirtyBits::TRANSFORM);
		assert_eq!(change("/World.visibility"), DirtyBits::VISIBILITY);
		assert_eq!(change("/World/Mesh.faceVertexIndices"), DirtyBits::TOPOLOGY);
		assert_eq!(change("/World/Mesh.primvars:displayColor"), DirtyBits::PRIMVAR);
		assert_eq!(change("/World/Mesh.primvars:displayColor:indices"), DirtyBits::CLEAN);
		assert_eq!(change("/World/Mesh.material:binding"), DirtyBits::MATERIAL_ID | DirtyBits::PRIMVAR);
		assert_eq!(change("/World/Mesh/Subset.indices"), DirtyBits::TOPOLOGY);
		assert_eq!(change("/World/Mesh.userProperty"), DirtyBits::CLEAN);
	}

	#[test]
	fn populate_binds_gprim_and_subset_materials() {
		let stage = usd::Stage::new();
		stage.define_prim("/World/Mesh", "Mesh").unwrap();
		stage.define_prim("/World/Cube", "Cube").unwrap();
		stage.define_prim("/World/Looks/Red", "Material").unwrap();
		stage.define_prim("/World/Looks/Blue", "Material").unwrap();
		stage.define_prim("/World/Mesh/Top", "GeomSubset").unwrap();
		stage.set_attribute("/World/Mesh.material:binding", p("/World/Looks/Red")).unwrap();
		stage.set_attribute("/World/Mesh/Top.material:binding", p("/World/Looks/Blue")).unwrap();
		stage.set_attribute("/World/Mesh/Top.indices", vec![0, 1]).unwrap();
		stage.set_attribute("/World/Cube.material:binding", p("/World/Mesh")).unwrap();

		let registry = AdapterRegistry::with_builtin();
		let config = DelegateConfig::default();
		let mut render_index = MemoryRenderIndex::new();
		let mut book = Bookkeeping::default();
		let mut index = IndexProxy::new(
			&stage,
			&registry,
			&config,
			QueryContext::new(usd::TimeCode::DEFAULT, &[]),
			&mut render_index,
			&mut book,
		);

		let adapter = GprimAdapter::new();
		let mesh = stage.prim_at_path("/World/Mesh").unwrap();
		let cube = stage.prim_at_path("/World/Cube").unwrap();
		assert_eq!(adapter.populate(&mesh, &mut index, None), p("/World/Mesh"));
		assert_eq!(adapter.populate(&cube, &mut index, None), p("/World/Cube"));

		let deps = index.dependencies();
		assert!(deps.equal_range(&p("/World/Looks/Red")).any(|c| *c == p("/World/Mesh")));
		assert!(deps.equal_range(&p("/World/Looks/Blue")).any(|c| *c == p("/World/Mesh")));
		assert!(deps.equal_range(&p("/World/Mesh/Top")).any(|c| *c == p("/World/Mesh")));
		assert!(!deps.equal_range(&p("/World/Mesh")).any(|c| *c == p("/World/Cube")));

		let query = index.query();
		match adapter.get_topology(&mesh, mesh.path(), &query) {
			Some(hd::Topology::Mesh(topology)) => {
				assert_eq!(topology.scheme, t("catmullClark"));
				assert_eq!(topology.geom_subsets.len(), 1);
				assert_eq!(topology.geom_subsets[0].material_id, p("/World/Looks/Blue"));
				assert_eq!(topology.geom_subsets[0].indices, vec![0, 1]);
			}
			other => panic!("unexpected topology {other:?}"),
		}
		drop(index);

		assert_eq!(render_index.sprim_ids(), vec![p("/World/Looks/Blue"), p("/World/Looks/Red")]);
		assert_eq!(render_index.rprim_ids(), vec![p("/World/Cube"), p("/World/Mesh")]);
	}

	#[test]
	fn implicit_shapes_have_extents() {
		let stage = usd::Stage::new();
		stage.define_prim("/Cube", "Cube").unwrap();
		stage.set_attribute("/Cube.size", 4.0).unwrap();
		let cube = stage.prim_at_path("/Cube").unwrap();
		let query = QueryContext::new(usd::TimeCode::DEFAULT, &[]);
		let extent = GprimAdapter::new().get_extent(&cube, cube.path(), &query);
		assert_eq!(extent, hd::Range3d::new(DVec3::splat(-2.0), DVec3::splat(2.0)));
		assert!(GprimAdapter::new().get_topology(&cube, cube.path(), &query).is_none());
	}
}
