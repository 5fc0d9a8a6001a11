//! Render-index side of scene synchronization: dirty bits, the retained
//! prim index contract and the data shapes delegates hand to renderers.

mod change_tracker;
mod render_index;
mod types;

pub use change_tracker::*;
pub use render_index::*;
pub use types::*;

use crate::{declare_public_tokens, tf};

declare_public_tokens!(PrimTypeTokens, PRIM_TYPE_TOKENS, [
	mesh: "mesh",
	basis_curves: "basisCurves",
	points: "points",
	material: "material",
	distant_light: "distantLight",
	dome_light: "domeLight",
	sphere_light: "sphereLight",
	rect_light: "rectLight",
	disk_light: "diskLight",
	cylinder_light: "cylinderLight",
]);

declare_public_tokens!(Tokens, TOKENS, [
	points: "points",
	normals: "normals",
	widths: "widths",
	display_color: "displayColor",
	display_opacity: "displayOpacity",
	instance_transform: "instanceTransform",
	double_sided: "doubleSided",
	render_tag: "renderTag",
]);
