use crate::{declare_public_tokens, tf, usd, vt};

declare_public_tokens!(Tokens, TOKENS, [
	interpolation: "interpolation",
	constant: "constant",

	primvars_prefix: "primvars:",
	indices_suffix: ":indices"
]);

/// An attribute in the `primvars:` namespace.
#[derive(Clone, Debug)]
pub struct Primvar<'a> {
	pub attr: usd::Attribute<'a>,
}

impl<'a> Primvar<'a> {
	pub fn new(attr: usd::Attribute<'a>) -> Self {
		Self { attr }
	}

	/// Name without the `primvars:` namespace, as published to the renderer.
	pub fn primvar_name(&self) -> tf::Token {
		let name = self.attr.name();
		name.strip_prefix(TOKENS.primvars_prefix.as_str()).unwrap_or(name)
	}

	/// Authored interpolation, `constant` when unauthored.
	pub fn interpolation(&self) -> tf::Token {
		self.attr
			.metadata(&TOKENS.interpolation)
			.unwrap_or_else(|| TOKENS.constant.clone())
	}

	/// Only constant primvars are inherited by descendant prims.
	pub fn is_inheritable(&self) -> bool {
		self.interpolation() == TOKENS.constant
	}

	pub fn type_name(&self) -> tf::Token {
		self.attr.type_name()
	}

	pub fn get(&self, time: usd::TimeCode) -> Option<vt::Value> {
		self.attr.get(time)
	}

	/// Return true if `name` is a primvar attribute name. Index arrays of
	/// indexed primvars share the namespace but are not primvars themselves.
	pub fn is_valid_primvar_name(name: &str) -> bool {
		name.starts_with(TOKENS.primvars_prefix.as_str()) && !name.ends_with(TOKENS.indices_suffix.as_str())
	}
}
