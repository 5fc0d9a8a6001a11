use bitflags::bitflags;

bitflags! {
	/// Per-prim invalidation state shared between a scene delegate and the render index.
	///
	/// Rprim bits are named directly. Sprims reuse the same bit space; their
	/// meanings are given by the `MATERIAL_*` and `LIGHT_*` constants.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct DirtyBits: u32 {
		const CLEAN = 0;
		const INIT_REPR = 1 << 0;
		const VARYING = 1 << 1;
		const PRIM_ID = 1 << 2;
		const EXTENT = 1 << 3;
		const DISPLAY_STYLE = 1 << 4;
		const POINTS = 1 << 5;
		const PRIMVAR = 1 << 6;
		const MATERIAL_ID = 1 << 7;
		const TOPOLOGY = 1 << 8;
		const TRANSFORM = 1 << 9;
		const VISIBILITY = 1 << 10;
		const NORMALS = 1 << 11;
		const DOUBLE_SIDED = 1 << 12;
		const CULL_STYLE = 1 << 13;
		const SUBDIV_TAGS = 1 << 14;
		const WIDTHS = 1 << 15;
		const INSTANCER = 1 << 16;
		const INSTANCE_INDEX = 1 << 17;
		const REPR = 1 << 18;
		const RENDER_TAG = 1 << 19;
		const ALL_DIRTY = !(1 << 1);
	}
}

impl DirtyBits {
	pub const MATERIAL_PARAMS: DirtyBits = DirtyBits::from_bits_retain(1 << 2);
	pub const MATERIAL_RESOURCE: DirtyBits = DirtyBits::from_bits_retain(1 << 3);

	pub const LIGHT_TRANSFORM: DirtyBits = DirtyBits::from_bits_retain(1 << 0);
	pub const LIGHT_PARAMS: DirtyBits = DirtyBits::from_bits_retain(1 << 2);
	pub const LIGHT_SHADOW_PARAMS: DirtyBits = DirtyBits::from_bits_retain(1 << 3);
	pub const LIGHT_COLLECTION: DirtyBits = DirtyBits::from_bits_retain(1 << 4);
	pub const LIGHT_RESOURCE: DirtyBits = DirtyBits::from_bits_retain(1 << 5);

	/// Return true if every bit of [`DirtyBits::ALL_DIRTY`] is set, which
	/// adapters use to request a resync.
	pub fn is_all_dirty(&self) -> bool {
		self.contains(DirtyBits::ALL_DIRTY)
	}

	pub fn is_clean(&self) -> bool {
		self.difference(DirtyBits::VARYING).is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn all_dirty_excludes_varying() {
		assert!(!DirtyBits::ALL_DIRTY.contains(DirtyBits::VARYING));
		assert!(DirtyBits::ALL_DIRTY.contains(DirtyBits::TRANSFORM | DirtyBits::INSTANCE_INDEX));
		assert!((DirtyBits::ALL_DIRTY | DirtyBits::VARYING).is_all_dirty());
		assert!(!(DirtyBits::TRANSFORM | DirtyBits::VISIBILITY).is_all_dirty());
		assert!(DirtyBits::VARYING.is_clean());
	}
}
