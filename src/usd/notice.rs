use crate::{sdf, tf};

/// Notification of scene edits, delivered after each edit or at the end of
/// a [`super::Stage::batch`].
///
/// Resynced paths name objects whose composed structure changed. Info-only
/// paths name objects whose values or metadata changed, together with the
/// metadata fields involved (empty for attribute value edits).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectsChanged {
	resynced_paths: Vec<sdf::Path>,
	changed_info_only_paths: Vec<(sdf::Path, Vec<tf::Token>)>,
}

impl ObjectsChanged {
	pub fn resynced_paths(&self) -> &[sdf::Path] {
		&self.resynced_paths
	}

	pub fn changed_info_only_paths(&self) -> &[(sdf::Path, Vec<tf::Token>)] {
		&self.changed_info_only_paths
	}

	pub fn is_empty(&self) -> bool {
		self.resynced_paths.is_empty() && self.changed_info_only_paths.is_empty()
	}

	pub(crate) fn resync(path: sdf::Path) -> Self {
		ObjectsChanged {
			resynced_paths: vec![path],
			changed_info_only_paths: Vec::new(),
		}
	}

	pub(crate) fn info_only(path: sdf::Path, fields: Vec<tf::Token>) -> Self {
		ObjectsChanged {
			resynced_paths: Vec::new(),
			changed_info_only_paths: vec![(path, fields)],
		}
	}

	pub(crate) fn merge(&mut self, other: ObjectsChanged) {
		for path in other.resynced_paths {
			if !self.resynced_paths.contains(&path) {
				self.resynced_paths.push(path);
			}
		}

		for (path, fields) in other.changed_info_only_paths {
			match self.changed_info_only_paths.iter_mut().find(|(p, _)| *p == path) {
				Some((_, existing)) => {
					for field in fields {
						if !existing.contains(&field) {
							existing.push(field);
						}
					}
				}
				None => self.changed_info_only_paths.push((path, fields)),
			}
		}
	}
}

/// Receiver of [`ObjectsChanged`] notices.
///
/// Stages hold listeners weakly, so dropping the last strong reference
/// unsubscribes the listener.
pub trait NoticeListener: Send + Sync {
	fn objects_changed(&self, notice: &ObjectsChanged);
}
