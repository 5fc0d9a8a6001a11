use super::{IndexProxy, InstancerContext, PrimAdapter, QueryContext, ValueCache};
use crate::hd::{self, DirtyBits};
use crate::{sdf, tf, usd, usd_shade};
use std::collections::BTreeMap;

const TERMINALS: [&str; 3] = ["surface", "displacement", "volume"];

/// Adapter for materials, populated by reference from the gprims bound to them.
///
/// The material's shaders are folded into one [`hd::MaterialNetwork`] and
/// never populated on their own.
#[derive(Debug, Default)]
pub struct MaterialAdapter;

impl MaterialAdapter {
	pub fn new() -> Self {
		Self
	}

	/// Shading network of `material` at `time`.
	pub fn build_network(material: &usd_shade::Material, time: usd::TimeCode) -> hd::MaterialNetwork {
		let mut network = hd::MaterialNetwork::default();

		for shader in material.shaders() {
			let shader_path = shader.prim().path().clone();
			let mut parameters = BTreeMap::new();

			for input in shader.inputs() {
				let targets = input.connection_targets();
				if targets.is_empty() {
					if let Some(value) = input.attribute().get(time) {
						parameters.insert(input.name().clone(), value);
					}
					continue;
				}
				for target in targets {
					network.relationships.push(hd::MaterialRelationship {
						input_id: shader_path.clone(),
						input_name: input.name().clone(),
						output_id: target.prim_path(),
						output_name: output_name(&target),
					});
				}
			}

			network.nodes.push(hd::MaterialNode {
				path: shader_path,
				identifier: shader.implementation_id().unwrap_or_default(),
				parameters,
			});
		}

		for output in material.outputs() {
			if !TERMINALS.contains(&output.name().as_str()) {
				continue;
			}
			if let Some(target) = output.connection_targets().first() {
				network.terminals.insert(output.name().clone(), target.prim_path());
			}
		}

		network
	}
}

fn output_name(target: &sdf::Path) -> tf::Token {
	let name = target.name_token();
	name.strip_prefix("outputs:").unwrap_or(name)
}

impl PrimAdapter for MaterialAdapter {
	fn name(&self) -> &'static str {
		"material"
	}

	fn populate(
		&self,
		prim: &usd::Prim,
		index: &mut IndexProxy,
		_instancer_context: Option<&InstancerContext>,
	) -> sdf::Path {
		let cache_path = prim.path().clone();
		if index.is_populated(&cache_path) {
			return cache_path;
		}
		index.insert_sprim(&hd::PRIM_TYPE_TOKENS.material, &cache_path, prim, None);
		log::trace!(target: "usd_imaging::changes", "Populated material <{cache_path}>");
		cache_path
	}

	fn should_cull_children(&self) -> bool {
		true
	}

	fn track_variability(
		&self,
		prim: &usd::Prim,
		_cache_path: &sdf::Path,
		_query: &QueryContext,
		time_varying_bits: &mut DirtyBits,
	) {
		let Some(material) = usd_shade::Material::enclosing(prim) else {
			return;
		};
		let varying = material
			.shaders()
			.iter()
			.flat_map(|shader| shader.inputs())
			.any(|input| input.attribute().might_be_time_varying());
		if varying {
			*time_varying_bits |= DirtyBits::MATERIAL_RESOURCE;
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
		if !requested_bits.intersects(DirtyBits::MATERIAL_RESOURCE | DirtyBits::MATERIAL_PARAMS) {
			return;
		}
		if let Some(network) = self.get_material_resource(prim, cache_path, query) {
			cache.set_material_resource(cache_path, network);
		}
	}

	fn process_property_change(&self, _prim: &usd::Prim, _cache_path: &sdf::Path, _property_path: &sdf::Path) -> DirtyBits {
		DirtyBits::MATERIAL_RESOURCE
	}

	/// Gprims bound to the material are resynced with it so they rebind.
	fn process_prim_resync(&self, cache_path: &sdf::Path, index: &mut IndexProxy) {
		index.resync_dependents(cache_path);
		self.remove_prim(cache_path, index);
		index.repopulate(cache_path);
	}

	fn remove_prim(&self, cache_path: &sdf::Path, index: &mut IndexProxy) {
		index.remove_sprim(&hd::PRIM_TYPE_TOKENS.material, cache_path);
	}

	fn mark_dirty(&self, _prim: &usd::Prim, cache_path: &sdf::Path, dirty: DirtyBits, index: &mut IndexProxy) {
		index.mark_sprim_dirty(cache_path, dirty);
	}

	fn get_material_resource(
		&self,
		prim: &usd::Prim,
		_cache_path: &sdf::Path,
		query: &QueryContext,
	) -> Option<hd::MaterialNetwork> {
		let material = usd_shade::Material::enclosing(prim)?;
		Some(Self::build_network(&material, query.time))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	fn t(s: &str) -> tf::Token {
		tf::Token::new(s)
	}

	#[test]
	fn network_collects_parameters_connections_and_terminals() {
		let stage = usd::Stage::new();
		stage.define_prim("/Looks/Red", "Material").unwrap();
		stage.define_prim("/Looks/Red/Surface", "Shader").unwrap();
		stage.define_prim("/Looks/Red/Texture", "Shader").unwrap();
		stage.set_attribute("/Looks/Red/Surface.info:id", t("UsdPreviewSurface")).unwrap();
		stage.set_attribute("/Looks/Red/Surface.inputs:roughness", 0.25f32).unwrap();
		stage.set_attribute("/Looks/Red/Surface.inputs:diffuseColor", glam::Vec3::ONE).unwrap();
		stage
			.set_attribute_metadata(
				"/Looks/Red/Surface.inputs:diffuseColor",
				"connectionPaths",
				vec![p("/Looks/Red/Texture.outputs:rgb")],
			)
			.unwrap();
		stage.set_attribute("/Looks/Red.outputs:surface", t("")).unwrap();
		stage
			.set_attribute_metadata(
				"/Looks/Red.outputs:surface",
				"connectionPaths",
				vec![p("/Looks/Red/Surface.outputs:surface")],
			)
			.unwrap();

		let material = usd_shade::Material::get(&stage, "/Looks/Red").unwrap();
		let network = MaterialAdapter::build_network(&material, usd::TimeCode::DEFAULT);

		assert_eq!(network.nodes.len(), 2);
		let surface = network.node(&p("/Looks/Red/Surface")).unwrap();
		assert_eq!(surface.identifier, t("UsdPreviewSurface"));
		assert_eq!(surface.parameters.get(&t("roughness")).and_then(|v| v.get::<f32>()), Some(0.25));
		assert!(!surface.parameters.contains_key(&t("diffuseColor")));

		assert_eq!(
			network.relationships,
			vec![hd::MaterialRelationship {
				input_id: p("/Looks/Red/Surface"),
				input_name: t("diffuseColor"),
				output_id: p("/Looks/Red/Texture"),
				output_name: t("rgb"),
			}]
		);
		assert_eq!(network.terminals.get(&t("surface")), Some(&p("/Looks/Red/Surface")));
	}
}
