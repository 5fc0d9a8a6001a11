use crate::{sdf, tf, usd};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Edits staged for the next synchronization pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PendingChanges {
	/// Structurally changed paths, in arrival order.
	pub resync: Vec<sdf::Path>,
	/// Value changes. Prim paths carry the changed metadata fields;
	/// property paths carry none.
	pub update: BTreeMap<sdf::Path, Vec<tf::Token>>,
}

impl PendingChanges {
	pub fn is_empty(&self) -> bool {
		self.resync.is_empty() && self.update.is_empty()
	}
}

/// Receives stage notices and stages them until the delegate applies them.
#[derive(Default, Debug)]
pub struct ChangeListener {
	pending: Mutex<PendingChanges>,
}

impl ChangeListener {
	pub fn new() -> Self {
		Self::default()
	}

	/// Take everything staged so far, leaving the listener empty.
	pub fn take(&self) -> PendingChanges {
		std::mem::take(&mut *self.pending.lock())
	}

	pub fn has_pending(&self) -> bool {
		!self.pending.lock().is_empty()
	}
}

impl usd::NoticeListener for ChangeListener {
	fn objects_changed(&self, notice: &usd::ObjectsChanged) {
		let mut pending = self.pending.lock();

		for path in notice.resynced_paths() {
			log::debug!(target: "usd_imaging::changes", "Resync queued: <{path}>");
			pending.resync.push(path.clone());
		}

		for (path, fields) in notice.changed_info_only_paths() {
			if path.is_absolute_root_or_prim_path() {
				// Prim edits that touch no fields cannot change anything adapters read.
				if fields.is_empty() {
					continue;
				}
				let staged = pending.update.entry(path.clone()).or_default();
				for field in fields {
					if !staged.contains(field) {
						staged.push(field.clone());
					}
				}
			} else if path.is_property_path() {
				pending.update.entry(path.clone()).or_default();
			} else {
				log::warn!("Ignoring change to unexpected path <{path}>");
				continue;
			}
			log::debug!(target: "usd_imaging::changes", "Refresh queued: <{path}>");
		}
	}
}
