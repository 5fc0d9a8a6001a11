use super::{NoticeListener, ObjectsChanged, Prim};
use crate::{sdf, tf, vt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

/// Errors reported by scene edits.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
	#[error("`{0}` is not a valid prim path")]
	InvalidPrimPath(sdf::Path),
	#[error("`{0}` is not a valid property path")]
	InvalidPropertyPath(sdf::Path),
	#[error("no prim is authored at `{0}`")]
	NoSuchPrim(sdf::Path),
	#[error("no attribute is authored at `{0}`")]
	NoSuchAttribute(sdf::Path),
	#[error("prototypes must be root prims, got `{0}`")]
	PrototypeNotAtRoot(sdf::Path),
	#[error("`{0}` is not a prototype")]
	NotAPrototype(sdf::Path),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AttributeSpec {
	pub default: Option<vt::Value>,
	/// Sorted by time.
	pub samples: Vec<(f64, vt::Value)>,
	pub metadata: HashMap<tf::Token, vt::Value>,
}

#[derive(Debug, Clone)]
pub(crate) struct PrimSpec {
	pub type_name: tf::Token,
	pub children: Vec<tf::Token>,
	pub active: bool,
	pub is_prototype: bool,
	pub instance_of: Option<sdf::Path>,
	pub attributes: BTreeMap<tf::Token, AttributeSpec>,
	pub metadata: HashMap<tf::Token, vt::Value>,
}

impl PrimSpec {
	fn new(type_name: tf::Token) -> Self {
		PrimSpec {
			type_name,
			children: Vec::new(),
			active: true,
			is_prototype: false,
			instance_of: None,
			attributes: BTreeMap::new(),
			metadata: HashMap::new(),
		}
	}

	pub fn is_instance(&self) -> bool {
		self.active && self.instance_of.is_some()
	}
}

#[derive(Default)]
struct NoticeBatch {
	depth: usize,
	pending: ObjectsChanged,
}

/// The outermost container for scene description, which owns and presents prims as a scenegraph.
///
/// Prims marked as instances share the namespace below a prototype root
/// prim. Paths below an instance resolve to instance proxies, which read
/// their data from the corresponding prim in the prototype.
pub struct Stage {
	prims: RwLock<HashMap<sdf::Path, PrimSpec>>,
	listeners: Mutex<Vec<Weak<dyn NoticeListener>>>,
	batch: Mutex<NoticeBatch>,
}

impl Stage {
	pub fn new() -> Arc<Self> {
		let mut prims = HashMap::new();
		prims.insert(sdf::Path::absolute_root_path(), PrimSpec::new(tf::Token::empty()));

		Arc::new(Self {
			prims: RwLock::new(prims),
			listeners: Mutex::new(Vec::new()),
			batch: Mutex::new(NoticeBatch::default()),
		})
	}

	pub fn pseudo_root(&self) -> Prim<'_> {
		let root = sdf::Path::absolute_root_path();
		Prim::new(self, root.clone(), root)
	}

	/// Return the prim at `path`, or `None` if nothing is composed there.
	///
	/// Paths below an instance yield instance proxies.
	pub fn prim_at_path(&self, path: impl Into<sdf::Path>) -> Option<Prim<'_>> {
		let path = path.into();
		let spec_path = self.resolve_spec_path(&path)?;
		Some(Prim::new(self, path, spec_path))
	}

	pub fn is_valid(&self, path: &sdf::Path) -> bool {
		self.resolve_spec_path(path).is_some()
	}

	/// All prototype root prims, ordered by path.
	pub fn prototypes(&self) -> Vec<Prim<'_>> {
		let prims = self.prims.read();
		let mut paths: Vec<sdf::Path> = prims
			.iter()
			.filter(|(_, spec)| spec.is_prototype)
			.map(|(path, _)| path.clone())
			.collect();
		paths.sort();
		paths
			.into_iter()
			.map(|path| Prim::new(self, path.clone(), path))
			.collect()
	}

	/// Return the prototype root containing `path`, if `path` lies inside a prototype.
	pub fn prototype_containing(&self, path: &sdf::Path) -> Option<sdf::Path> {
		let root = path.prefixes().into_iter().next()?;
		let prims = self.prims.read();
		prims
			.get(&root)
			.filter(|spec| spec.is_prototype)
			.map(|_| root)
	}

	pub(crate) fn with_spec<R>(&self, spec_path: &sdf::Path, f: impl FnOnce(&PrimSpec) -> R) -> Option<R> {
		self.prims.read().get(spec_path).map(f)
	}

	pub(crate) fn with_attribute<R>(&self, spec_path: &sdf::Path, f: impl FnOnce(&AttributeSpec) -> R) -> Option<R> {
		let prims = self.prims.read();
		let spec = prims.get(&spec_path.prim_path())?;
		spec.attributes.get(&spec_path.name_token()).map(f)
	}

	fn resolve_spec_path(&self, path: &sdf::Path) -> Option<sdf::Path> {
		if path.is_absolute_root() {
			return Some(path.clone());
		}
		if !path.is_prim_path() {
			return None;
		}

		let prims = self.prims.read();
		let mut current = sdf::Path::absolute_root_path();

		for prefix in path.prefixes() {
			let name = prefix.name_token();
			let spec = prims.get(&current)?;

			if current.is_absolute_root() {
				let child = prims.get(&prefix)?;
				if !spec.children.contains(&name) && !child.is_prototype {
					return None;
				}
				current = prefix;
				continue;
			}

			if !spec.active {
				return None;
			}

			let parent = match &spec.instance_of {
				Some(prototype) => prototype.clone(),
				None => current.clone(),
			};
			if !prims.get(&parent)?.children.contains(&name) {
				return None;
			}
			current = parent.append_child(&name);
		}

		Some(current)
	}
}

/// Authoring.
impl Stage {
	/// Define a prim of `type_name` at `path`, creating typeless ancestors as needed.
	pub fn define_prim(&self, path: impl Into<sdf::Path>, type_name: &str) -> Result<(), StageError> {
		let path = path.into();
		if !path.is_prim_path() {
			return Err(StageError::InvalidPrimPath(path));
		}

		let type_name = tf::Token::new(type_name);
		let notice = {
			let mut prims = self.prims.write();

			let mut created = None;
			for prefix in path.prefixes() {
				if prims.contains_key(&prefix) {
					continue;
				}
				let name = prefix.name_token();
				let parent = prefix.parent_path();
				if let Some(parent_spec) = prims.get_mut(&parent) {
					parent_spec.children.push(name);
				}
				prims.insert(prefix.clone(), PrimSpec::new(tf::Token::empty()));
				created.get_or_insert(prefix);
			}

			let spec = prims.get_mut(&path).ok_or_else(|| StageError::NoSuchPrim(path.clone()))?;
			let retyped = spec.type_name != type_name;
			spec.type_name = type_name;

			match created {
				Some(top) => Some(ObjectsChanged::resync(top)),
				None if retyped => Some(ObjectsChanged::resync(path.clone())),
				None => None,
			}
		};

		if let Some(notice) = notice {
			self.notify(notice);
		}
		Ok(())
	}

	/// Define a root-level prototype prim. Prototypes are not children of the
	/// pseudo root and are only reachable through instances or by path.
	pub fn define_prototype(&self, path: impl Into<sdf::Path>) -> Result<(), StageError> {
		let path = path.into();
		if !path.is_prim_path() {
			return Err(StageError::InvalidPrimPath(path));
		}
		if !path.parent_path().is_absolute_root() {
			return Err(StageError::PrototypeNotAtRoot(path));
		}

		{
			let mut prims = self.prims.write();
			let spec = prims
				.entry(path.clone())
				.or_insert_with(|| PrimSpec::new(tf::Token::empty()));
			spec.is_prototype = true;
			if let Some(root) = prims.get_mut(&sdf::Path::absolute_root_path()) {
				let name = path.name_token();
				root.children.retain(|child| *child != name);
			}
		}

		self.notify(ObjectsChanged::resync(path));
		Ok(())
	}

	/// Make the prim at `path` an instance of `prototype`.
	pub fn set_instance(&self, path: impl Into<sdf::Path>, prototype: impl Into<sdf::Path>) -> Result<(), StageError> {
		let path = path.into();
		let prototype = prototype.into();
		{
			let mut prims = self.prims.write();
			if !prims.get(&prototype).is_some_and(|spec| spec.is_prototype) {
				return Err(StageError::NotAPrototype(prototype));
			}
			let spec = prims.get_mut(&path).ok_or_else(|| StageError::NoSuchPrim(path.clone()))?;
			spec.instance_of = Some(prototype);
		}

		self.notify(ObjectsChanged::resync(path));
		Ok(())
	}

	pub fn clear_instance(&self, path: impl Into<sdf::Path>) -> Result<(), StageError> {
		let path = path.into();
		{
			let mut prims = self.prims.write();
			let spec = prims.get_mut(&path).ok_or_else(|| StageError::NoSuchPrim(path.clone()))?;
			spec.instance_of = None;
		}

		self.notify(ObjectsChanged::resync(path));
		Ok(())
	}

	/// Remove the prim at `path` and everything authored below it.
	pub fn remove_prim(&self, path: impl Into<sdf::Path>) -> Result<(), StageError> {
		let path = path.into();
		if !path.is_prim_path() {
			return Err(StageError::InvalidPrimPath(path));
		}

		{
			let mut prims = self.prims.write();
			if !prims.contains_key(&path) {
				return Err(StageError::NoSuchPrim(path));
			}
			prims.retain(|spec_path, _| !spec_path.has_prefix(&path));
			if let Some(parent) = prims.get_mut(&path.parent_path()) {
				let name = path.name_token();
				parent.children.retain(|child| *child != name);
			}
		}

		self.notify(ObjectsChanged::resync(path));
		Ok(())
	}

	pub fn set_active(&self, path: impl Into<sdf::Path>, active: bool) -> Result<(), StageError> {
		let path = path.into();
		let changed = {
			let mut prims = self.prims.write();
			let spec = prims.get_mut(&path).ok_or_else(|| StageError::NoSuchPrim(path.clone()))?;
			std::mem::replace(&mut spec.active, active) != active
		};

		if changed {
			self.notify(ObjectsChanged::resync(path));
		}
		Ok(())
	}

	/// Author the default value of the attribute at `path`.
	///
	/// Creating an attribute resyncs it; changing an existing one is an
	/// info-only change.
	pub fn set_attribute(&self, path: impl Into<sdf::Path>, value: impl Into<vt::Value>) -> Result<(), StageError> {
		let value = value.into();
		self.edit_attribute(path.into(), |attr| attr.default = Some(value))
	}

	/// Replace the time samples of the attribute at `path`.
	pub fn set_time_samples(
		&self,
		path: impl Into<sdf::Path>,
		samples: impl IntoIterator<Item = (f64, vt::Value)>,
	) -> Result<(), StageError> {
		let mut samples: Vec<(f64, vt::Value)> = samples.into_iter().collect();
		samples.sort_by(|a, b| a.0.total_cmp(&b.0));
		samples.dedup_by(|later, earlier| later.0 == earlier.0);
		self.edit_attribute(path.into(), |attr| attr.samples = samples)
	}

	pub fn set_attribute_metadata(
		&self,
		path: impl Into<sdf::Path>,
		key: &str,
		value: impl Into<vt::Value>,
	) -> Result<(), StageError> {
		let path = path.into();
		let key = tf::Token::new(key);
		{
			let mut prims = self.prims.write();
			let spec = prims
				.get_mut(&path.prim_path())
				.ok_or_else(|| StageError::NoSuchPrim(path.prim_path()))?;
			let attr = spec
				.attributes
				.get_mut(&path.name_token())
				.ok_or_else(|| StageError::NoSuchAttribute(path.clone()))?;
			attr.metadata.insert(key.clone(), value.into());
		}

		self.notify(ObjectsChanged::info_only(path, vec![key]));
		Ok(())
	}

	pub fn clear_attribute(&self, path: impl Into<sdf::Path>) -> Result<(), StageError> {
		let path = path.into();
		{
			let mut prims = self.prims.write();
			let spec = prims
				.get_mut(&path.prim_path())
				.ok_or_else(|| StageError::NoSuchPrim(path.prim_path()))?;
			spec.attributes
				.remove(&path.name_token())
				.ok_or_else(|| StageError::NoSuchAttribute(path.clone()))?;
		}

		self.notify(ObjectsChanged::resync(path));
		Ok(())
	}

	/// Author prim metadata such as `kind` or `documentation`.
	pub fn set_metadata(&self, path: impl Into<sdf::Path>, key: &str, value: impl Into<vt::Value>) -> Result<(), StageError> {
		let path = path.into();
		let key = tf::Token::new(key);
		{
			let mut prims = self.prims.write();
			let spec = prims.get_mut(&path).ok_or_else(|| StageError::NoSuchPrim(path.clone()))?;
			spec.metadata.insert(key.clone(), value.into());
		}

		self.notify(ObjectsChanged::info_only(path, vec![key]));
		Ok(())
	}

	fn edit_attribute(&self, path: sdf::Path, edit: impl FnOnce(&mut AttributeSpec)) -> Result<(), StageError> {
		if !path.is_property_path() {
			return Err(StageError::InvalidPropertyPath(path));
		}

		let created = {
			let mut prims = self.prims.write();
			let spec = prims
				.get_mut(&path.prim_path())
				.ok_or_else(|| StageError::NoSuchPrim(path.prim_path()))?;
			let name = path.name_token();
			let created = !spec.attributes.contains_key(&name);
			edit(spec.attributes.entry(name).or_default());
			created
		};

		self.notify(if created {
			ObjectsChanged::resync(path)
		} else {
			ObjectsChanged::info_only(path, Vec::new())
		});
		Ok(())
	}
}

/// Change notification.
impl Stage {
	pub fn register_listener(&self, listener: Weak<dyn NoticeListener>) {
		self.listeners.lock().push(listener);
	}

	/// Run `edits` with notices coalesced into a single [`ObjectsChanged`]
	/// delivered when the outermost batch ends.
	pub fn batch<R>(&self, edits: impl FnOnce(&Stage) -> R) -> R {
		self.batch.lock().depth += 1;
		let result = edits(self);

		let notice = {
			let mut batch = self.batch.lock();
			batch.depth -= 1;
			if batch.depth == 0 {
				Some(std::mem::take(&mut batch.pending))
			} else {
				None
			}
		};

		if let Some(notice) = notice
			&& !notice.is_empty()
		{
			self.deliver(&notice);
		}
		result
	}

	fn notify(&self, notice: ObjectsChanged) {
		{
			let mut batch = self.batch.lock();
			if batch.depth > 0 {
				batch.pending.merge(notice);
				return;
			}
		}
		self.deliver(&notice);
	}

	fn deliver(&self, notice: &ObjectsChanged) {
		let listeners: Vec<Arc<dyn NoticeListener>> = {
			let mut listeners = self.listeners.lock();
			listeners.retain(|listener| listener.strong_count() > 0);
			listeners.iter().filter_map(Weak::upgrade).collect()
		};

		log::trace!(
			target: "usd::notice",
			"ObjectsChanged: {} resynced, {} info-only",
			notice.resynced_paths().len(),
			notice.changed_info_only_paths().len()
		);

		for listener in listeners {
			listener.objects_changed(notice);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::usd::TimeCode;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	#[derive(Default)]
	struct Recorder {
		notices: Mutex<Vec<ObjectsChanged>>,
	}

	impl NoticeListener for Recorder {
		fn objects_changed(&self, notice: &ObjectsChanged) {
			self.notices.lock().push(notice.clone());
		}
	}

	fn listen(stage: &Stage) -> Arc<Recorder> {
		let recorder = Arc::new(Recorder::default());
		let weak: Weak<dyn NoticeListener> = Arc::downgrade(&recorder) as Weak<dyn NoticeListener>;
		stage.register_listener(weak);
		recorder
	}

	#[test]
	fn define_creates_ancestors() {
		let stage = Stage::new();
		stage.define_prim("/World/Geom/Mesh", "Mesh").unwrap();

		let world = stage.prim_at_path("/World").unwrap();
		assert_eq!(world.type_name(), tf::Token::empty());
		let mesh = stage.prim_at_path("/World/Geom/Mesh").unwrap();
		assert_eq!(mesh.type_name(), "Mesh");
		assert_eq!(stage.pseudo_root().children().len(), 1);
	}

	#[test]
	fn instance_proxies_resolve_through_prototype() {
		let stage = Stage::new();
		stage.define_prototype("/__Proto_1").unwrap();
		stage.define_prim("/__Proto_1/Mesh", "Mesh").unwrap();
		stage.define_prim("/World/A", "Xform").unwrap();
		stage.set_instance("/World/A", "/__Proto_1").unwrap();

		let proxy = stage.prim_at_path("/World/A/Mesh").unwrap();
		assert!(proxy.is_instance_proxy());
		assert!(!proxy.is_in_prototype());
		assert_eq!(proxy.prim_in_prototype().path(), &p("/__Proto_1/Mesh"));

		let instance = stage.prim_at_path("/World/A").unwrap();
		assert!(instance.is_instance());
		assert!(instance.children().is_empty());
		assert_eq!(instance.filtered_children(true).len(), 1);

		assert!(stage.prim_at_path("/__Proto_1/Mesh").unwrap().is_in_prototype());
		assert_eq!(stage.pseudo_root().children().len(), 1);
	}

	#[test]
	fn inactive_prims_hide_descendants() {
		let stage = Stage::new();
		stage.define_prim("/World/Mesh", "Mesh").unwrap();
		stage.set_active("/World", false).unwrap();

		assert!(!stage.prim_at_path("/World").unwrap().is_active());
		assert!(stage.prim_at_path("/World/Mesh").is_none());
	}

	#[test]
	fn attribute_creation_resyncs_and_edits_are_info_only() {
		let stage = Stage::new();
		stage.define_prim("/World/Mesh", "Mesh").unwrap();
		let recorder = listen(&stage);

		stage.set_attribute("/World/Mesh.doubleSided", true).unwrap();
		stage.set_attribute("/World/Mesh.doubleSided", false).unwrap();
		stage.set_metadata("/World/Mesh", "kind", tf::Token::new("component")).unwrap();

		let notices = recorder.notices.lock();
		assert_eq!(notices.len(), 3);
		assert_eq!(notices[0].resynced_paths(), &[p("/World/Mesh.doubleSided")]);
		assert_eq!(notices[1].changed_info_only_paths(), &[(p("/World/Mesh.doubleSided"), vec![])]);
		assert_eq!(
			notices[2].changed_info_only_paths(),
			&[(p("/World/Mesh"), vec![tf::Token::new("kind")])]
		);
	}

	#[test]
	fn batch_coalesces_notices() {
		let stage = Stage::new();
		let recorder = listen(&stage);

		stage.batch(|stage| {
			stage.define_prim("/World/A", "Mesh").unwrap();
			stage.define_prim("/World/B", "Mesh").unwrap();
		});

		let notices = recorder.notices.lock();
		assert_eq!(notices.len(), 1);
		assert_eq!(notices[0].resynced_paths(), &[p("/World"), p("/World/B")]);
	}

	#[test]
	fn dropped_listeners_are_released() {
		let stage = Stage::new();
		let recorder = listen(&stage);
		drop(recorder);
		stage.define_prim("/World", "Xform").unwrap();
		assert!(stage.listeners.lock().is_empty());
	}

	#[test]
	fn time_samples_are_held() {
		let stage = Stage::new();
		stage.define_prim("/World", "Xform").unwrap();
		stage
			.set_time_samples("/World.size", [(1.0, vt::Value::from(1.0)), (5.0, vt::Value::from(5.0))])
			.unwrap();
		stage.set_attribute("/World.size", 0.5).unwrap();

		let prim = stage.prim_at_path("/World").unwrap();
		let attr = prim.attribute(&tf::Token::new("size"));
		assert_eq!(attr.get_typed::<f64>(TimeCode::DEFAULT), Some(0.5));
		assert_eq!(attr.get_typed::<f64>(TimeCode::new(0.0)), Some(1.0));
		assert_eq!(attr.get_typed::<f64>(TimeCode::new(3.0)), Some(1.0));
		assert_eq!(attr.get_typed::<f64>(TimeCode::new(9.0)), Some(5.0));
		assert!(attr.might_be_time_varying());
		assert_eq!(attr.time_samples_in_interval(0.0, 2.0), vec![1.0]);
	}
}
