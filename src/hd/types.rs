use crate::{sdf, tf, vt};
use glam::DVec3;
use std::collections::BTreeMap;

/// Axis-aligned bounds. An empty range has `min > max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range3d {
	pub min: DVec3,
	pub max: DVec3,
}

impl Range3d {
	pub fn new(min: DVec3, max: DVec3) -> Self {
		Self { min, max }
	}

	pub fn empty() -> Self {
		Self {
			min: DVec3::splat(f64::MAX),
			max: DVec3::splat(f64::MIN),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.min.cmpgt(self.max).any()
	}
}

impl Default for Range3d {
	fn default() -> Self {
		Self::empty()
	}
}

/// A face subset of a mesh with its own material.
#[derive(Debug, Clone, PartialEq)]
pub struct GeomSubset {
	pub id: sdf::Path,
	pub material_id: sdf::Path,
	pub indices: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshTopology {
	pub scheme: tf::Token,
	pub orientation: tf::Token,
	pub face_vertex_counts: Vec<i32>,
	pub face_vertex_indices: Vec<i32>,
	pub hole_indices: Vec<i32>,
	pub geom_subsets: Vec<GeomSubset>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BasisCurvesTopology {
	pub curve_type: tf::Token,
	pub basis: tf::Token,
	pub wrap: tf::Token,
	pub curve_vertex_counts: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Topology {
	Mesh(MeshTopology),
	BasisCurves(BasisCurvesTopology),
	Points { count: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialNode {
	pub path: sdf::Path,
	pub identifier: tf::Token,
	pub parameters: BTreeMap<tf::Token, vt::Value>,
}

/// A connection from `output_name` on `output_id` into `input_name` on `input_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialRelationship {
	pub input_id: sdf::Path,
	pub input_name: tf::Token,
	pub output_id: sdf::Path,
	pub output_name: tf::Token,
}

/// Shading network of a material, as handed to renderers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaterialNetwork {
	pub nodes: Vec<MaterialNode>,
	pub relationships: Vec<MaterialRelationship>,
	/// Terminal name, e.g. `surface`, to the node that drives it.
	pub terminals: BTreeMap<tf::Token, sdf::Path>,
}

impl MaterialNetwork {
	pub fn node(&self, path: &sdf::Path) -> Option<&MaterialNode> {
		self.nodes.iter().find(|node| node.path == *path)
	}
}
