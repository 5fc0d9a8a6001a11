//! Geometry schemas: imageable types, transforms, visibility and primvars.

mod imageable;
mod primvar;
mod primvars_api;
mod xform_op;

pub use imageable::*;
pub use primvar::Primvar;
pub use primvars_api::PrimvarsApi;
pub use xform_op::*;

use crate::{declare_public_tokens, tf};

declare_public_tokens!(Tokens, TOKENS, [
	visibility: "visibility",
	inherited: "inherited",
	invisible: "invisible",
	purpose: "purpose",
	default_: "default",
	render: "render",
	proxy: "proxy",
	guide: "guide",
	model_draw_mode: "model:drawMode",
	xform_op_order: "xformOpOrder",
	reset_xform_stack: "!resetXformStack!",
	extent: "extent",
	points: "points",
	normals: "normals",
	widths: "widths",
	velocities: "velocities",
	accelerations: "accelerations",
	double_sided: "doubleSided",
	face_vertex_counts: "faceVertexCounts",
	face_vertex_indices: "faceVertexIndices",
	hole_indices: "holeIndices",
	subdivision_scheme: "subdivisionScheme",
	orientation: "orientation",
	curve_vertex_counts: "curveVertexCounts",
	basis: "basis",
	curve_type: "type",
	wrap: "wrap",
	size: "size",
	radius: "radius",
	height: "height",
	axis: "axis",
]);

/// Schema types that take part in imaging. Typed prims outside this set,
/// such as materials, shaders and geometry subsets, prune traversal.
const IMAGEABLE_TYPES: &[&str] = &[
	"Xform",
	"Scope",
	"Mesh",
	"BasisCurves",
	"NurbsCurves",
	"Points",
	"Cube",
	"Sphere",
	"Cylinder",
	"Cone",
	"Capsule",
	"Plane",
	"PointInstancer",
	"Camera",
	"SkelRoot",
	"DistantLight",
	"DomeLight",
	"SphereLight",
	"RectLight",
	"DiskLight",
	"CylinderLight",
];

/// Return true if prims of `type_name` are imageable.
pub fn is_imageable_type(type_name: &tf::Token) -> bool {
	IMAGEABLE_TYPES.contains(&type_name.as_str())
}
