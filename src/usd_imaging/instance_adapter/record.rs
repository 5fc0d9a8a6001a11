use crate::usd_imaging::PrimAdapter;
use crate::{sdf, tf, usd};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// A prototype prim populated on behalf of an instancer.
#[derive(Clone)]
pub(crate) struct ProtoPrim {
	/// The prim inside the prototype, or the instancer prim when the
	/// prototype root itself was populated.
	pub path: sdf::Path,
	pub adapter: Arc<dyn PrimAdapter>,
}

/// Cached visibility of one drawn instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visibility {
	Unknown,
	Visible,
	Invisible,
	/// Animated along the instance context; evaluated at every query.
	Varying,
}

/// Per-instancer state rebuilt lazily by variability tracking and queries.
#[derive(Debug, Default)]
pub(crate) struct DrawCache {
	pub num_instances: Option<usize>,
	/// One entry per drawn instance, or empty until first classified.
	pub visibility: Vec<Visibility>,
	/// Variability and update requests for the instancer are still queued.
	pub refresh: bool,
}

impl DrawCache {
	/// Forget everything derived from the instance set.
	pub fn reset(&mut self) {
		self.num_instances = None;
		self.visibility.clear();
	}
}

/// Everything that forces instances of one prototype apart.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct BucketKey {
	pub material: sdf::Path,
	pub draw_mode: tf::Token,
	pub purpose: tf::Token,
	/// `(name, type)` of the constant primvars the instances inherit, sorted.
	pub inherited_primvars: Vec<(tf::Token, tf::Token)>,
}

/// A renderer instancer drawing every instance of one prototype that
/// shares a [`BucketKey`].
pub(crate) struct InstancerRecord {
	pub prototype: sdf::Path,
	pub key: BucketKey,
	pub instances: BTreeSet<sdf::Path>,
	/// Prototype-side paths of the instances whose prototypes contain this
	/// instancer's instances.
	pub parent_instances: BTreeSet<sdf::Path>,
	/// Instances found inside the prototype, each drawn by its own instancer.
	pub nested_instances: Vec<sdf::Path>,
	/// Prototype cache path to the prototype prim it images.
	pub prim_map: BTreeMap<sdf::Path, ProtoPrim>,
	pub cache: Mutex<DrawCache>,
}

impl InstancerRecord {
	pub fn new(prototype: sdf::Path, key: BucketKey) -> Self {
		Self {
			prototype,
			key,
			instances: BTreeSet::new(),
			parent_instances: BTreeSet::new(),
			nested_instances: Vec::new(),
			prim_map: BTreeMap::new(),
			cache: Mutex::new(DrawCache {
				refresh: true,
				..Default::default()
			}),
		}
	}
}

/// Every instancer the adapter has populated, keyed by instancer path.
///
/// An instancer is named after the first instance that created it.
#[derive(Default)]
pub(crate) struct InstancerArena {
	pub records: BTreeMap<sdf::Path, InstancerRecord>,
	pub prototype_to_instancers: BTreeMap<sdf::Path, Vec<sdf::Path>>,
	pub instance_to_instancer: BTreeMap<sdf::Path, sdf::Path>,
}

impl InstancerArena {
	/// The instancer already drawing instances of `prototype` under `key`.
	pub fn find_bucket(&self, prototype: &sdf::Path, key: &BucketKey) -> Option<sdf::Path> {
		self.prototype_to_instancers
			.get(prototype)?
			.iter()
			.find(|instancer| self.records.get(*instancer).is_some_and(|record| record.key == *key))
			.cloned()
	}

	/// Number of instances `instancer` draws, expanding nested instances
	/// through every instancer of their prototype.
	pub fn count_instances(&self, stage: &usd::Stage, instancer: &sdf::Path) -> usize {
		let mut memo = HashMap::new();
		self.count_instances_memo(stage, instancer, &mut memo)
	}

	fn count_instances_memo(
		&self,
		stage: &usd::Stage,
		instancer: &sdf::Path,
		memo: &mut HashMap<sdf::Path, usize>,
	) -> usize {
		if let Some(count) = memo.get(instancer) {
			return *count;
		}
		let Some(record) = self.records.get(instancer) else {
			return 0;
		};

		let mut count = 0;
		for instance in &record.instances {
			match stage.prototype_containing(instance) {
				None => count += 1,
				Some(prototype) => {
					for outer in self.prototype_to_instancers.get(&prototype).into_iter().flatten() {
						count += self.count_instances_memo(stage, outer, memo);
					}
				}
			}
		}
		memo.insert(instancer.clone(), count);
		count
	}

	/// Instancers whose draw set depends on `instance`: the one drawing it,
	/// then those drawing the instances nested in it, breadth first.
	pub fn dependent_instancers(&self, instance: &sdf::Path) -> Vec<sdf::Path> {
		let mut visited = BTreeSet::new();
		let mut order = Vec::new();
		let mut queue = VecDeque::from([instance.clone()]);

		while let Some(instance) = queue.pop_front() {
			let Some(instancer) = self.instance_to_instancer.get(&instance) else {
				continue;
			};
			if !visited.insert(instancer.clone()) {
				continue;
			}
			order.push(instancer.clone());
			if let Some(record) = self.records.get(instancer) {
				queue.extend(record.nested_instances.iter().cloned());
			}
		}
		order
	}

	/// Instancers connected to `instance` through nesting in either
	/// direction. Unloading any of them invalidates the others.
	pub fn connected_instancers(&self, instance: &sdf::Path) -> BTreeSet<sdf::Path> {
		let mut instancers = BTreeSet::new();
		let mut stack = vec![instance.clone()];
		let mut seen = BTreeSet::new();

		while let Some(instance) = stack.pop() {
			if !seen.insert(instance.clone()) {
				continue;
			}
			let Some(instancer) = self.instance_to_instancer.get(&instance) else {
				continue;
			};
			if !instancers.insert(instancer.clone()) {
				continue;
			}
			if let Some(record) = self.records.get(instancer) {
				stack.extend(record.nested_instances.iter().cloned());
				stack.extend(record.parent_instances.iter().cloned());
			}
		}
		instancers
	}

	/// Detach `instancer` and every mapping pointing at it.
	pub fn remove(&mut self, instancer: &sdf::Path) -> Option<InstancerRecord> {
		let record = self.records.remove(instancer)?;
		if let Some(instancers) = self.prototype_to_instancers.get_mut(&record.prototype) {
			instancers.retain(|path| path != instancer);
			if instancers.is_empty() {
				self.prototype_to_instancers.remove(&record.prototype);
			}
		}
		for instance in &record.instances {
			if self.instance_to_instancer.get(instance) == Some(instancer) {
				self.instance_to_instancer.remove(instance);
			}
		}
		Some(record)
	}
}
