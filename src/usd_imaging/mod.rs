//! Incremental synchronization of a [`usd::Stage`](crate::usd::Stage) into a
//! [`RenderIndex`](crate::hd::RenderIndex), including resolution of native
//! instancing into renderer instancers.

mod adapter;
mod adapter_registry;
mod change_listener;
mod config;
mod delegate;
mod dependency;
mod diagnostic;
mod error;
mod gprim_adapter;
mod index_proxy;
mod instance_adapter;
mod light_adapter;
mod material_adapter;
mod population;
mod prim_info;
mod value_cache;
mod worker;

pub use adapter::*;
pub use adapter_registry::AdapterRegistry;
pub use change_listener::{ChangeListener, PendingChanges};
pub use config::DelegateConfig;
pub use delegate::{Delegate, SyncState};
pub use dependency::DependencyIndex;
pub use error::{ImagingError, Result};
pub use gprim_adapter::GprimAdapter;
pub use index_proxy::IndexProxy;
pub use instance_adapter::{InstanceAdapter, InstanceContexts};
pub use light_adapter::LightAdapter;
pub use material_adapter::MaterialAdapter;
pub use prim_info::{PrimInfo, PrimInfoTable};
pub use value_cache::ValueCache;
pub use worker::Worker;

use crate::{declare_public_tokens, tf};

declare_public_tokens!(Tokens, TOKENS, [
	material: "Material",
	shader: "Shader",
	geom_subset: "GeomSubset",
	family_name: "familyName",
	material_bind: "materialBind",
	indices: "indices",
	hidden: "hidden",
	primvars_prefix: "primvars:",
]);

/// Prim-level metadata fields that never affect imaging.
const IGNORED_PRIM_FIELDS: &[&str] = &[
	"documentation",
	"comment",
	"customData",
	"assetInfo",
	"displayName",
	"hidden",
];

pub(crate) fn is_ignored_prim_field(field: &tf::Token) -> bool {
	IGNORED_PRIM_FIELDS.contains(&field.as_str())
}

/// Schema types the light adapter handles, paired with their sprim types.
pub(crate) const LIGHT_TYPES: &[(&str, &str)] = &[
	("DistantLight", "distantLight"),
	("DomeLight", "domeLight"),
	("SphereLight", "sphereLight"),
	("RectLight", "rectLight"),
	("DiskLight", "diskLight"),
	("CylinderLight", "cylinderLight"),
];

/// Schema types the gprim adapter handles, paired with their rprim types.
pub(crate) const GPRIM_TYPES: &[(&str, &str)] = &[
	("Mesh", "mesh"),
	("Cube", "mesh"),
	("Sphere", "mesh"),
	("Cylinder", "mesh"),
	("Cone", "mesh"),
	("Capsule", "mesh"),
	("BasisCurves", "basisCurves"),
	("Points", "points"),
];
