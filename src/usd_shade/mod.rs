//! Shading schemas: materials, shaders and material binding resolution.

use crate::{declare_public_tokens, sdf, tf, usd};

declare_public_tokens!(Tokens, TOKENS, [
	material: "Material",
	shader: "Shader",
	node_graph: "NodeGraph",
	material_binding: "material:binding",
	connection_paths: "connectionPaths",
	info_id: "info:id",
	implementation_source: "info:implementationSource",
	surface: "surface",
	displacement: "displacement",
	volume: "volume",
]);

const INPUT_PREFIX: &str = "inputs:";
const OUTPUT_PREFIX: &str = "outputs:";

pub struct Shader<'a> {
	prim: usd::Prim<'a>,
}

impl<'a> Shader<'a> {
	pub fn get(stage: &'a usd::Stage, path: impl Into<sdf::Path>) -> Option<Self> {
		get_typed_prim(stage, path, &TOKENS.shader).map(|prim| Self { prim })
	}

	pub fn new(prim: usd::Prim<'a>) -> Option<Self> {
		(prim.type_name() == TOKENS.shader).then_some(Self { prim })
	}

	pub fn prim(&self) -> &usd::Prim<'a> {
		&self.prim
	}

	pub fn implementation_id(&self) -> Option<tf::Token> {
		self.get_token_attr(&TOKENS.info_id)
	}

	pub fn implementation_source(&self) -> Option<tf::Token> {
		self.get_token_attr(&TOKENS.implementation_source)
	}

	fn get_token_attr(&self, name: &tf::Token) -> Option<tf::Token> {
		self.prim
			.attribute(name)
			.get_typed::<tf::Token>(usd::TimeCode::DEFAULT)
	}

	pub fn inputs(&self) -> Vec<Port<'a>> {
		collect_ports(&self.prim, INPUT_PREFIX)
	}

	pub fn outputs(&self) -> Vec<Port<'a>> {
		collect_ports(&self.prim, OUTPUT_PREFIX)
	}
}

/// An input or output of a shading node.
pub struct Port<'a> {
	attr: usd::Attribute<'a>,
	base_name: tf::Token,
}

impl<'a> Port<'a> {
	/// Port name without the `inputs:` or `outputs:` namespace.
	pub fn name(&self) -> &tf::Token {
		&self.base_name
	}

	pub fn attribute(&self) -> &usd::Attribute<'a> {
		&self.attr
	}

	/// Paths of the outputs this port is connected to.
	pub fn connection_targets(&self) -> Vec<sdf::Path> {
		self.attr
			.metadata::<Vec<sdf::Path>>(&TOKENS.connection_paths)
			.unwrap_or_default()
	}
}

pub struct Material<'a> {
	prim: usd::Prim<'a>,
}

impl<'a> Material<'a> {
	pub fn get(stage: &'a usd::Stage, path: impl Into<sdf::Path>) -> Option<Self> {
		get_typed_prim(stage, path, &TOKENS.material).map(|prim| Self { prim })
	}

	pub fn prim(&self) -> &usd::Prim<'a> {
		&self.prim
	}

	pub fn outputs(&self) -> Vec<Port<'a>> {
		collect_ports(&self.prim, OUTPUT_PREFIX)
	}

	pub fn surface_output(&self) -> Option<Port<'a>> {
		self.outputs()
			.into_iter()
			.find(|output| *output.name() == TOKENS.surface)
	}

	/// Shader prims below the material, depth first, descending through node graphs.
	pub fn shaders(&self) -> Vec<Shader<'a>> {
		let mut shaders = Vec::new();
		let mut stack: Vec<usd::Prim<'a>> = self.prim.filtered_children(true);
		stack.reverse();
		while let Some(prim) = stack.pop() {
			let type_name = prim.type_name();
			if type_name == TOKENS.node_graph {
				let mut children = prim.filtered_children(true);
				children.reverse();
				stack.extend(children);
			} else if let Some(shader) = Shader::new(prim) {
				shaders.push(shader);
			}
		}
		shaders
	}

	/// Return the material enclosing `prim`, if `prim` is a material or lives inside one.
	pub fn enclosing(prim: &usd::Prim<'a>) -> Option<Material<'a>> {
		std::iter::successors(Some(prim.clone()), |prim| prim.parent())
			.take_while(|prim| !prim.is_pseudo_root())
			.find(|prim| prim.type_name() == TOKENS.material)
			.map(|prim| Material { prim })
	}
}

/// Resolves `material:binding` opinions to bound materials.
pub struct MaterialBindingApi<'a> {
	prim: &'a usd::Prim<'a>,
}

impl<'a> MaterialBindingApi<'a> {
	pub fn new(prim: &'a usd::Prim<'a>) -> Self {
		Self { prim }
	}

	/// Return true if `name` is a property that can affect material binding.
	pub fn can_contain_property_name(name: &tf::Token) -> bool {
		name.as_str().starts_with(TOKENS.material_binding.as_str())
	}

	/// The binding target authored directly on the prim.
	pub fn direct_binding(&self) -> Option<sdf::Path> {
		direct_binding(self.prim)
	}

	/// Path of the material bound to the prim, found on the prim or its
	/// nearest ancestor with a binding. Bindings that do not target a
	/// material resolve to the empty path.
	pub fn compute_bound_material(&self) -> sdf::Path {
		let target = std::iter::successors(Some(self.prim.clone()), |prim| prim.parent())
			.take_while(|prim| !prim.is_pseudo_root())
			.find_map(|prim| direct_binding(&prim));

		match target {
			Some(path) if Material::get(self.prim.stage(), &path).is_some() => path,
			Some(path) => {
				log::debug!("<{}> is bound to <{}>, which is not a material", self.prim.path(), path);
				sdf::Path::empty_path()
			}
			None => sdf::Path::empty_path(),
		}
	}
}

fn direct_binding(prim: &usd::Prim) -> Option<sdf::Path> {
	prim.attribute(&TOKENS.material_binding)
		.get_typed::<sdf::Path>(usd::TimeCode::DEFAULT)
		.filter(|path| !path.is_empty())
}

fn get_typed_prim<'a>(
	stage: &'a usd::Stage,
	path: impl Into<sdf::Path>,
	type_name: &tf::Token,
) -> Option<usd::Prim<'a>> {
	stage
		.prim_at_path(path)
		.filter(|prim| prim.type_name() == *type_name)
}

fn collect_ports<'a>(prim: &usd::Prim<'a>, prefix: &str) -> Vec<Port<'a>> {
	prim.attribute_names()
		.into_iter()
		.filter_map(|name| {
			let base_name = name.strip_prefix(prefix)?;
			Some(Port {
				attr: prim.attribute(&name),
				base_name,
			})
		})
		.collect()
}
