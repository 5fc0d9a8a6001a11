use super::record::InstancerArena;
use crate::{sdf, usd};
use std::collections::btree_set;
use std::slice;

#[derive(Clone)]
enum Frame<'a> {
	Instances(btree_set::Iter<'a, sdf::Path>),
	/// Instancers of the prototype containing the innermost context entry.
	Instancers(slice::Iter<'a, sdf::Path>),
}

/// Depth-first walk of every instance an instancer draws.
///
/// Yields `(context, index)` pairs. The context lists the instance prims
/// leading to one drawn instance, innermost first: an instance nested in a
/// prototype is followed by each instance of that prototype. Indices count
/// up from zero in draw order, which is the order instance arrays are laid
/// out in.
#[derive(Clone)]
pub struct InstanceContexts<'a> {
	arena: &'a InstancerArena,
	stage: &'a usd::Stage,
	frames: Vec<Frame<'a>>,
	context: Vec<sdf::Path>,
	next_index: usize,
}

impl<'a> InstanceContexts<'a> {
	pub(crate) fn new(arena: &'a InstancerArena, stage: &'a usd::Stage, instancer: &sdf::Path) -> Self {
		let frames = arena
			.records
			.get(instancer)
			.map(|record| vec![Frame::Instances(record.instances.iter())])
			.unwrap_or_default();
		Self {
			arena,
			stage,
			frames,
			context: Vec::new(),
			next_index: 0,
		}
	}
}

impl Iterator for InstanceContexts<'_> {
	type Item = (Vec<sdf::Path>, usize);

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			match self.frames.last_mut()? {
				Frame::Instances(instances) => {
					let Some(instance) = instances.next() else {
						self.frames.pop();
						continue;
					};
					match self.stage.prototype_containing(instance) {
						None => {
							let mut context = self.context.clone();
							context.push(instance.clone());
							let index = self.next_index;
							self.next_index += 1;
							return Some((context, index));
						}
						Some(prototype) => {
							let outer = self
								.arena
								.prototype_to_instancers
								.get(&prototype)
								.map(|instancers| instancers.iter())
								.unwrap_or_default();
							self.context.push(instance.clone());
							self.frames.push(Frame::Instancers(outer));
						}
					}
				}
				Frame::Instancers(instancers) => match instancers.next() {
					Some(instancer) => {
						let instances = self
							.arena
							.records
							.get(instancer)
							.map(|record| record.instances.iter())
							.unwrap_or_default();
						self.frames.push(Frame::Instances(instances));
					}
					None => {
						self.frames.pop();
						self.context.pop();
					}
				},
			}
		}
	}
}

/// Fold an instance chain, innermost first, into the scene path it denotes:
/// each entry's prototype root is replaced by the path of the next.
pub(crate) fn path_from_chain(chain: &[sdf::Path]) -> sdf::Path {
	let Some((outermost, inner)) = chain.split_last() else {
		return sdf::Path::empty_path();
	};
	inner.iter().rev().fold(outermost.clone(), |path, link| {
		match link.prefixes().first() {
			Some(root) => link.replace_prefix(root, &path),
			None => path,
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::usd_imaging::instance_adapter::record::{BucketKey, InstancerRecord};

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	#[test]
	fn chains_fold_into_scene_paths() {
		assert_eq!(path_from_chain(&[]), sdf::Path::empty_path());
		assert_eq!(path_from_chain(&[p("/World/A")]), p("/World/A"));
		assert_eq!(path_from_chain(&[p("/__Proto_1/Mesh"), p("/World/B")]), p("/World/B/Mesh"));
		assert_eq!(
			path_from_chain(&[p("/__Proto_2/Mesh"), p("/__Proto_1/Inner"), p("/World/A")]),
			p("/World/A/Inner/Mesh")
		);
	}

	#[test]
	fn nested_contexts_expand_through_outer_instances() {
		let stage = usd::Stage::new();
		stage.define_prototype("/__Proto_1").unwrap();
		stage.define_prototype("/__Proto_2").unwrap();
		stage.define_prim("/__Proto_1/Left", "Xform").unwrap();
		stage.define_prim("/__Proto_1/Right", "Xform").unwrap();
		stage.define_prim("/World/A", "Xform").unwrap();
		stage.define_prim("/World/B", "Xform").unwrap();

		let mut arena = InstancerArena::default();
		let mut outer = InstancerRecord::new(p("/__Proto_1"), BucketKey::default());
		outer.instances.extend([p("/World/A"), p("/World/B")]);
		arena.records.insert(p("/World/A"), outer);
		let mut inner = InstancerRecord::new(p("/__Proto_2"), BucketKey::default());
		inner.instances.extend([p("/__Proto_1/Left"), p("/__Proto_1/Right")]);
		arena.records.insert(p("/__Proto_1/Left"), inner);
		arena.prototype_to_instancers.insert(p("/__Proto_1"), vec![p("/World/A")]);

		let contexts: Vec<_> = InstanceContexts::new(&arena, &stage, &p("/__Proto_1/Left")).collect();
		assert_eq!(
			contexts,
			vec![
				(vec![p("/__Proto_1/Left"), p("/World/A")], 0),
				(vec![p("/__Proto_1/Left"), p("/World/B")], 1),
				(vec![p("/__Proto_1/Right"), p("/World/A")], 2),
				(vec![p("/__Proto_1/Right"), p("/World/B")], 3),
			]
		);
		assert_eq!(contexts.len(), arena.count_instances(&stage, &p("/__Proto_1/Left")));

		let outer: Vec<_> = InstanceContexts::new(&arena, &stage, &p("/World/A")).collect();
		assert_eq!(outer, vec![(vec![p("/World/A")], 0), (vec![p("/World/B")], 1)]);
		assert_eq!(InstanceContexts::new(&arena, &stage, &p("/Missing")).count(), 0);
	}
}
