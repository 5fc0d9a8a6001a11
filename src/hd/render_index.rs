use super::DirtyBits;
use crate::{sdf, tf};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimKind {
	Rprim,
	Sprim,
	Bprim,
	Instancer,
}

/// Retained-mode store of renderable prims, owned by a renderer and fed by
/// a scene delegate.
///
/// Every inserted prim starts fully dirty. Dirty marks accumulate until the
/// renderer cleans them after pulling data.
pub trait RenderIndex: Send {
	fn insert_rprim(&mut self, type_id: &tf::Token, id: &sdf::Path, instancer_id: &sdf::Path);
	fn insert_sprim(&mut self, type_id: &tf::Token, id: &sdf::Path);
	fn insert_bprim(&mut self, type_id: &tf::Token, id: &sdf::Path);
	fn insert_instancer(&mut self, id: &sdf::Path, parent_id: &sdf::Path);

	fn remove_rprim(&mut self, id: &sdf::Path);
	fn remove_sprim(&mut self, type_id: &tf::Token, id: &sdf::Path);
	fn remove_bprim(&mut self, type_id: &tf::Token, id: &sdf::Path);
	fn remove_instancer(&mut self, id: &sdf::Path);

	fn mark_rprim_dirty(&mut self, id: &sdf::Path, bits: DirtyBits);
	fn mark_sprim_dirty(&mut self, id: &sdf::Path, bits: DirtyBits);
	fn mark_bprim_dirty(&mut self, id: &sdf::Path, bits: DirtyBits);
	fn mark_instancer_dirty(&mut self, id: &sdf::Path, bits: DirtyBits);

	fn is_rprim_type_supported(&self, _type_id: &tf::Token) -> bool {
		true
	}

	fn is_sprim_type_supported(&self, _type_id: &tf::Token) -> bool {
		true
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
	pub type_id: tf::Token,
	/// Instancer for rprims, parent instancer for instancers.
	pub instancer_id: sdf::Path,
	pub dirty_bits: DirtyBits,
}

/// A [`RenderIndex`] that records prims and dirty state in memory.
#[derive(Debug, Default)]
pub struct MemoryRenderIndex {
	rprims: BTreeMap<sdf::Path, IndexEntry>,
	sprims: BTreeMap<sdf::Path, IndexEntry>,
	bprims: BTreeMap<sdf::Path, IndexEntry>,
	instancers: BTreeMap<sdf::Path, IndexEntry>,
	insert_count: usize,
	remove_count: usize,
}

impl MemoryRenderIndex {
	pub fn new() -> Self {
		Self::default()
	}

	fn table(&self, kind: PrimKind) -> &BTreeMap<sdf::Path, IndexEntry> {
		match kind {
			PrimKind::Rprim => &self.rprims,
			PrimKind::Sprim => &self.sprims,
			PrimKind::Bprim => &self.bprims,
			PrimKind::Instancer => &self.instancers,
		}
	}

	fn table_mut(&mut self, kind: PrimKind) -> &mut BTreeMap<sdf::Path, IndexEntry> {
		match kind {
			PrimKind::Rprim => &mut self.rprims,
			PrimKind::Sprim => &mut self.sprims,
			PrimKind::Bprim => &mut self.bprims,
			PrimKind::Instancer => &mut self.instancers,
		}
	}

	fn insert(&mut self, kind: PrimKind, type_id: &tf::Token, id: &sdf::Path, instancer_id: &sdf::Path) {
		let entry = IndexEntry {
			type_id: type_id.clone(),
			instancer_id: instancer_id.clone(),
			dirty_bits: DirtyBits::ALL_DIRTY,
		};
		if self.table_mut(kind).insert(id.clone(), entry).is_some() {
			log::warn!("{kind:?} <{id}> inserted twice, replacing the existing entry");
		}
		self.insert_count += 1;
	}

	fn remove(&mut self, kind: PrimKind, id: &sdf::Path) {
		if self.table_mut(kind).remove(id).is_none() {
			log::warn!("Removing unknown {kind:?} <{id}>");
			return;
		}
		self.remove_count += 1;
	}

	fn mark_dirty(&mut self, kind: PrimKind, id: &sdf::Path, bits: DirtyBits) {
		match self.table_mut(kind).get_mut(id) {
			Some(entry) => entry.dirty_bits |= bits,
			None => log::warn!("Marking unknown {kind:?} <{id}> dirty"),
		}
	}

	pub fn entry(&self, kind: PrimKind, id: &sdf::Path) -> Option<&IndexEntry> {
		self.table(kind).get(id)
	}

	pub fn contains(&self, kind: PrimKind, id: &sdf::Path) -> bool {
		self.table(kind).contains_key(id)
	}

	pub fn has_rprim(&self, id: &sdf::Path) -> bool {
		self.contains(PrimKind::Rprim, id)
	}

	pub fn has_sprim(&self, id: &sdf::Path) -> bool {
		self.contains(PrimKind::Sprim, id)
	}

	pub fn has_instancer(&self, id: &sdf::Path) -> bool {
		self.contains(PrimKind::Instancer, id)
	}

	/// Ids of every prim of `kind`, in path order.
	pub fn ids(&self, kind: PrimKind) -> Vec<sdf::Path> {
		self.table(kind).keys().cloned().collect()
	}

	pub fn rprim_ids(&self) -> Vec<sdf::Path> {
		self.ids(PrimKind::Rprim)
	}

	pub fn sprim_ids(&self) -> Vec<sdf::Path> {
		self.ids(PrimKind::Sprim)
	}

	pub fn instancer_ids(&self) -> Vec<sdf::Path> {
		self.ids(PrimKind::Instancer)
	}

	pub fn dirty_bits(&self, kind: PrimKind, id: &sdf::Path) -> DirtyBits {
		self.entry(kind, id)
			.map(|entry| entry.dirty_bits)
			.unwrap_or(DirtyBits::CLEAN)
	}

	/// Clear dirty state on every prim, as a renderer does after a sync.
	pub fn mark_all_clean(&mut self) {
		for table in [&mut self.rprims, &mut self.sprims, &mut self.bprims, &mut self.instancers] {
			for entry in table.values_mut() {
				entry.dirty_bits = DirtyBits::CLEAN;
			}
		}
	}

	/// Total number of prims of all kinds.
	pub fn len(&self) -> usize {
		self.rprims.len() + self.sprims.len() + self.bprims.len() + self.instancers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn insert_count(&self) -> usize {
		self.insert_count
	}

	pub fn remove_count(&self) -> usize {
		self.remove_count
	}
}

impl RenderIndex for MemoryRenderIndex {
	fn insert_rprim(&mut self, type_id: &tf::Token, id: &sdf::Path, instancer_id: &sdf::Path) {
		self.insert(PrimKind::Rprim, type_id, id, instancer_id);
	}

	fn insert_sprim(&mut self, type_id: &tf::Token, id: &sdf::Path) {
		self.insert(PrimKind::Sprim, type_id, id, &sdf::Path::empty_path());
	}

	fn insert_bprim(&mut self, type_id: &tf::Token, id: &sdf::Path) {
		self.insert(PrimKind::Bprim, type_id, id, &sdf::Path::empty_path());
	}

	fn insert_instancer(&mut self, id: &sdf::Path, parent_id: &sdf::Path) {
		self.insert(PrimKind::Instancer, &tf::Token::empty(), id, parent_id);
	}

	fn remove_rprim(&mut self, id: &sdf::Path) {
		self.remove(PrimKind::Rprim, id);
	}

	fn remove_sprim(&mut self, _type_id: &tf::Token, id: &sdf::Path) {
		self.remove(PrimKind::Sprim, id);
	}

	fn remove_bprim(&mut self, _type_id: &tf::Token, id: &sdf::Path) {
		self.remove(PrimKind::Bprim, id);
	}

	fn remove_instancer(&mut self, id: &sdf::Path) {
		self.remove(PrimKind::Instancer, id);
	}

	fn mark_rprim_dirty(&mut self, id: &sdf::Path, bits: DirtyBits) {
		self.mark_dirty(PrimKind::Rprim, id, bits);
	}

	fn mark_sprim_dirty(&mut self, id: &sdf::Path, bits: DirtyBits) {
		self.mark_dirty(PrimKind::Sprim, id, bits);
	}

	fn mark_bprim_dirty(&mut self, id: &sdf::Path, bits: DirtyBits) {
		self.mark_dirty(PrimKind::Bprim, id, bits);
	}

	fn mark_instancer_dirty(&mut self, id: &sdf::Path, bits: DirtyBits) {
		self.mark_dirty(PrimKind::Instancer, id, bits);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	#[test]
	fn insert_mark_and_clean() {
		let mut index = MemoryRenderIndex::new();
		index.insert_instancer(&p("/World/A"), &sdf::Path::empty_path());
		index.insert_rprim(&tf::Token::new("mesh"), &p("/World/A.proto_Mesh_id0"), &p("/World/A"));
		assert_eq!(index.len(), 2);
		assert_eq!(
			index.entry(PrimKind::Rprim, &p("/World/A.proto_Mesh_id0")).unwrap().instancer_id,
			p("/World/A")
		);

		index.mark_all_clean();
		index.mark_rprim_dirty(&p("/World/A.proto_Mesh_id0"), DirtyBits::TRANSFORM);
		assert_eq!(index.dirty_bits(PrimKind::Rprim, &p("/World/A.proto_Mesh_id0")), DirtyBits::TRANSFORM);
		assert_eq!(index.dirty_bits(PrimKind::Instancer, &p("/World/A")), DirtyBits::CLEAN);

		index.remove_rprim(&p("/World/A.proto_Mesh_id0"));
		index.remove_rprim(&p("/World/A.proto_Mesh_id0"));
		assert_eq!(index.remove_count(), 1);
		assert_eq!(index.rprim_ids(), Vec::<sdf::Path>::new());
	}
}
