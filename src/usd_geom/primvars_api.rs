use super::primvar::{Primvar, TOKENS};
use crate::{tf, usd};

/// [`PrimvarsApi`] encodes geometric "primitive variables" as [`Primvar`],
/// which interpolate across a primitive's topology,
/// can override shader inputs, and inherit down namespace.
pub struct PrimvarsApi<'a> {
	pub prim: &'a usd::Prim<'a>,
}

impl<'a> PrimvarsApi<'a> {
	/// Construct a [`PrimvarsApi`] for the given [`usd::Prim`].
	pub fn new(prim: &'a usd::Prim<'a>) -> Self {
		Self { prim }
	}

	/// Return the [`Primvar`] object named by `name`.
	///
	/// Name lookup will account for Primvar namespacing.
	pub fn primvar(&self, name: &tf::Token) -> Primvar<'a> {
		let attr_name = make_namespaced(name);
		Primvar::new(self.prim.attribute(&attr_name))
	}

	/// Is there a defined [`Primvar`] `name` on this prim?
	///
	/// Name lookup will account for Primvar namespacing.
	pub fn has_primvar(&self, name: &tf::Token) -> bool {
		let attr_name = make_namespaced(name);
		self.prim.has_attribute(&attr_name)
	}

	/// All primvars authored on this prim, in name order.
	pub fn primvars(&self) -> Vec<Primvar<'a>> {
		self.prim
			.attribute_names()
			.iter()
			.filter(|name| Primvar::is_valid_primvar_name(name.as_str()))
			.map(|name| Primvar::new(self.prim.attribute(name)))
			.collect()
	}

	/// Constant primvars authored on this prim's ancestors that this prim
	/// inherits, nearest ancestor first. Primvars authored on the prim itself
	/// are not included.
	pub fn find_inheritable_primvars(&self) -> Vec<Primvar<'a>> {
		let mut found: Vec<Primvar<'a>> = Vec::new();
		let mut ancestor = self.prim.parent();
		while let Some(prim) = ancestor {
			if prim.is_pseudo_root() {
				break;
			}
			for attr_name in prim.attribute_names() {
				if !Primvar::is_valid_primvar_name(attr_name.as_str())
					|| self.prim.has_attribute(&attr_name)
					|| found.iter().any(|pv| pv.attr.name() == attr_name)
				{
					continue;
				}
				let primvar = Primvar::new(prim.attribute(&attr_name));
				if primvar.is_inheritable() {
					found.push(primvar);
				}
			}
			ancestor = prim.parent();
		}
		found
	}

	/// Find `name` on this prim, or as an inheritable primvar on an ancestor.
	pub fn find_primvar_with_inheritance(&self, name: &tf::Token) -> Option<Primvar<'a>> {
		if self.has_primvar(name) {
			return Some(self.primvar(name));
		}
		let attr_name = make_namespaced(name);
		self.find_inheritable_primvars()
			.into_iter()
			.find(|pv| pv.attr.name() == attr_name)
	}
}

fn make_namespaced(name: &tf::Token) -> tf::Token {
	if name.as_str().starts_with(TOKENS.primvars_prefix.as_str()) {
		name.clone()
	} else {
		tf::Token::new(format!("{}{}", TOKENS.primvars_prefix, name))
	}
}
