use super::{Attribute, Stage};
use crate::{sdf, tf, vt::ValueType};

/// [`Prim`] is the sole persistent scenegraph object on a [`Stage`].
///
/// A prim below an instance is an instance proxy: it has a path in the
/// instance's namespace but reads its data from the prim in the prototype.
#[derive(Clone)]
pub struct Prim<'a> {
	stage: &'a Stage,
	path: sdf::Path,
	spec_path: sdf::Path,
}

impl<'a> Prim<'a> {
	pub(crate) fn new(stage: &'a Stage, path: sdf::Path, spec_path: sdf::Path) -> Self {
		Prim { stage, path, spec_path }
	}

	pub fn stage(&self) -> &'a Stage {
		self.stage
	}

	pub fn path(&self) -> &sdf::Path {
		&self.path
	}

	pub fn name(&self) -> tf::Token {
		self.path.name_token()
	}

	pub fn type_name(&self) -> tf::Token {
		self.stage
			.with_spec(&self.spec_path, |spec| spec.type_name.clone())
			.unwrap_or_default()
	}

	pub fn is_pseudo_root(&self) -> bool {
		self.path.is_absolute_root()
	}

	pub fn is_active(&self) -> bool {
		self.stage
			.with_spec(&self.spec_path, |spec| spec.active)
			.unwrap_or(false)
	}

	pub fn metadata<T: ValueType>(&self, key: &tf::Token) -> Option<T> {
		self.stage
			.with_spec(&self.spec_path, |spec| spec.metadata.get(key).and_then(|v| v.get::<T>()))
			.flatten()
	}

	pub fn parent(&self) -> Option<Prim<'a>> {
		if self.is_pseudo_root() {
			return None;
		}
		self.stage.prim_at_path(self.path.parent_path())
	}

	/// Composed children, not descending into instances.
	pub fn children(&self) -> Vec<Prim<'a>> {
		self.filtered_children(false)
	}

	/// Composed children. Children of an instance are reported as instance
	/// proxies when `traverse_instance_proxies` is set, and omitted otherwise.
	pub fn filtered_children(&self, traverse_instance_proxies: bool) -> Vec<Prim<'a>> {
		let source = match self.stage.with_spec(&self.spec_path, |spec| {
			spec.is_instance().then(|| spec.instance_of.clone()).flatten()
		}) {
			Some(Some(prototype)) if traverse_instance_proxies => prototype,
			Some(Some(_)) | None => return Vec::new(),
			Some(None) => self.spec_path.clone(),
		};

		let names = self
			.stage
			.with_spec(&source, |spec| spec.children.clone())
			.unwrap_or_default();

		names
			.iter()
			.filter_map(|name| {
				let spec_path = source.append_child(name);
				let is_prototype = self
					.stage
					.with_spec(&spec_path, |spec| spec.is_prototype)
					.unwrap_or(true);
				(!is_prototype).then(|| Prim::new(self.stage, self.path.append_child(name), spec_path))
			})
			.collect()
	}
}

/// Instancing
impl<'a> Prim<'a> {
	/// Return true if this prim is an active instance of a prototype.
	pub fn is_instance(&self) -> bool {
		self.stage
			.with_spec(&self.spec_path, |spec| spec.is_instance())
			.unwrap_or(false)
	}

	pub fn is_instance_proxy(&self) -> bool {
		self.path != self.spec_path
	}

	pub fn is_prototype(&self) -> bool {
		!self.is_instance_proxy()
			&& self
				.stage
				.with_spec(&self.spec_path, |spec| spec.is_prototype)
				.unwrap_or(false)
	}

	/// Return true if this prim is a prototype or lies inside one.
	/// Instance proxies live in their instance's namespace and are not.
	pub fn is_in_prototype(&self) -> bool {
		self.stage.prototype_containing(&self.path).is_some()
	}

	/// The prototype this instance shares, if it is an instance.
	pub fn prototype(&self) -> Option<Prim<'a>> {
		let prototype = self
			.stage
			.with_spec(&self.spec_path, |spec| {
				spec.is_instance().then(|| spec.instance_of.clone()).flatten()
			})
			.flatten()?;
		Some(Prim::new(self.stage, prototype.clone(), prototype))
	}

	/// The prim in the prototype that this instance proxy reads from, or
	/// the prim itself when it is not a proxy.
	pub fn prim_in_prototype(&self) -> Prim<'a> {
		Prim::new(self.stage, self.spec_path.clone(), self.spec_path.clone())
	}
}

/// Attributes
impl<'a> Prim<'a> {
	/// Return an [`Attribute`] with the given `name`. The attribute may not be authored.
	pub fn attribute(&self, name: &tf::Token) -> Attribute<'a> {
		Attribute::new(
			self.stage,
			self.path.append_property(name),
			self.spec_path.append_property(name),
		)
	}

	pub fn has_attribute(&self, name: &tf::Token) -> bool {
		self.stage
			.with_spec(&self.spec_path, |spec| spec.attributes.contains_key(name))
			.unwrap_or(false)
	}

	/// Names of all authored attributes, in name order.
	pub fn attribute_names(&self) -> Vec<tf::Token> {
		self.stage
			.with_spec(&self.spec_path, |spec| spec.attributes.keys().cloned().collect())
			.unwrap_or_default()
	}

	pub fn attributes(&self) -> Vec<Attribute<'a>> {
		self.attribute_names()
			.iter()
			.map(|name| self.attribute(name))
			.collect()
	}
}

impl std::fmt::Debug for Prim<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "Prim(<{}>)", self.path)
	}
}
