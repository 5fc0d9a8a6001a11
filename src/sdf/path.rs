use crate::tf;
use std::sync::Arc;

/// Errors produced when parsing a textual path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
	#[error("path `{0}` is not absolute")]
	NotAbsolute(String),
	#[error("path `{path}` has an invalid element `{element}`")]
	InvalidElement { path: String, element: String },
}

/// A path value used to locate objects in the scenegraph.
///
/// Paths order element-wise, so every path sorts directly before its
/// descendants and a namespace subtree occupies one contiguous range of
/// any ordered container keyed by paths.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
	absolute: bool,
	elements: Arc<[tf::Token]>,
	prop: Option<tf::Token>,
}

impl Path {
	/// The empty path value.
	pub fn empty_path() -> Self {
		Self {
			absolute: false,
			elements: Arc::from([]),
			prop: None,
		}
	}

	/// The absolute path representing the top of the namespace hierarchy.
	pub fn absolute_root_path() -> Self {
		Self {
			absolute: true,
			elements: Arc::from([]),
			prop: None,
		}
	}

	/// Parse an absolute prim or property path such as `/World/Mesh.points`.
	pub fn new(text: &str) -> Result<Self, PathError> {
		if text.is_empty() {
			return Ok(Self::empty_path());
		}

		let Some(body) = text.strip_prefix('/') else {
			return Err(PathError::NotAbsolute(text.to_string()));
		};

		let invalid = |element: &str| PathError::InvalidElement {
			path: text.to_string(),
			element: element.to_string(),
		};

		let (prim_part, prop) = match body.rsplit_once('.') {
			Some((prim_part, prop)) => (prim_part, Some(prop)),
			None => (body, None),
		};

		let mut elements = Vec::new();
		if !prim_part.is_empty() {
			for element in prim_part.split('/') {
				if !is_identifier(element) {
					return Err(invalid(element));
				}
				elements.push(tf::Token::new(element));
			}
		}

		let prop = match prop {
			Some(name) if elements.is_empty() || !is_property_name(name) => return Err(invalid(name)),
			Some(name) => Some(tf::Token::new(name)),
			None => None,
		};

		Ok(Self {
			absolute: true,
			elements: Arc::from(elements),
			prop,
		})
	}
}

/// Querying paths.
impl Path {
	/// Returns true if this path is the [`Self::empty_path`].
	pub fn is_empty(&self) -> bool {
		!self.absolute
	}

	/// Returns true if this path is the [`Self::absolute_root_path`].
	pub fn is_absolute_root(&self) -> bool {
		self.absolute && self.elements.is_empty()
	}

	/// Returns whether the path identifies a prim.
	pub fn is_prim_path(&self) -> bool {
		self.absolute && !self.elements.is_empty() && self.prop.is_none()
	}

	pub fn is_absolute_root_or_prim_path(&self) -> bool {
		self.absolute && self.prop.is_none()
	}

	/// Returns whether the path identifies a property of a prim.
	pub fn is_property_path(&self) -> bool {
		self.prop.is_some()
	}

	/// Return the path that identifies this path's namespace parent.
	///
	/// The parent of a property path is its owning prim; the parent of the
	/// absolute root is the empty path.
	pub fn parent_path(&self) -> Self {
		if self.is_empty() || self.is_absolute_root() {
			return Self::empty_path();
		}

		if self.prop.is_some() {
			return self.prim_path();
		}

		Self {
			absolute: true,
			elements: Arc::from(&self.elements[..self.elements.len() - 1]),
			prop: None,
		}
	}

	/// Strip any property element, leaving the owning prim path.
	pub fn prim_path(&self) -> Self {
		Self {
			absolute: self.absolute,
			elements: self.elements.clone(),
			prop: None,
		}
	}

	/// Return a range for iterating over the ancestors of this path.
	///
	/// The range provides iteration over the prefixes of a path, ordered from longest to shortest.
	/// Starting with the path itself and ending with a single element path, not including the empty/root path.
	pub fn ancestors_range(&self) -> PathAncestorsRange {
		PathAncestorsRange { path: self.clone() }
	}

	/// Prim prefixes of this path from shortest to longest, including the
	/// prim path itself.
	pub fn prefixes(&self) -> Vec<Path> {
		(1..=self.elements.len())
			.map(|len| Self {
				absolute: true,
				elements: Arc::from(&self.elements[..len]),
				prop: None,
			})
			.collect()
	}

	/// Returns the name of the prim or property identified by the path.
	pub fn name(&self) -> String {
		self.name_token().as_str().to_string()
	}

	pub fn name_token(&self) -> tf::Token {
		match (&self.prop, self.elements.last()) {
			(Some(prop), _) => prop.clone(),
			(None, Some(element)) => element.clone(),
			(None, None) => tf::Token::empty(),
		}
	}

	/// Return true if this path is `prefix` or lies in the namespace below it.
	pub fn has_prefix(&self, prefix: &Path) -> bool {
		if prefix.is_empty() || self.is_empty() {
			return false;
		}

		if prefix.prop.is_some() {
			return self.prop == prefix.prop && self.elements == prefix.elements;
		}

		self.elements.starts_with(&prefix.elements)
	}

	/// Replace `old_prefix` with `new_prefix` if this path has it, otherwise
	/// return the path unchanged.
	pub fn replace_prefix(&self, old_prefix: &Path, new_prefix: &Path) -> Self {
		if !self.has_prefix(old_prefix) {
			return self.clone();
		}

		if old_prefix.prop.is_some() {
			return new_prefix.clone();
		}

		let remainder = &self.elements[old_prefix.elements.len()..];
		if new_prefix.prop.is_some() && (!remainder.is_empty() || self.prop.is_some()) {
			return Self::empty_path();
		}

		let mut elements = new_prefix.elements.to_vec();
		elements.extend_from_slice(remainder);

		Self {
			absolute: new_prefix.absolute,
			elements: Arc::from(elements),
			prop: self.prop.clone().or_else(|| new_prefix.prop.clone()),
		}
	}
}

/// Creating new paths by appending an element.
impl Path {
	/// Creates a path by appending an element for `child_name` to this path.
	///
	/// Returns the empty path if this path is not a prim path or the root.
	pub fn append_child(&self, child_name: &tf::Token) -> Self {
		if !self.is_absolute_root_or_prim_path() || !is_identifier(child_name.as_str()) {
			return Self::empty_path();
		}

		let mut elements = self.elements.to_vec();
		elements.push(child_name.clone());

		Self {
			absolute: true,
			elements: Arc::from(elements),
			prop: None,
		}
	}

	/// Creates a path by appending an element for `prop_name` to this path.
	///
	/// Returns the empty path if this path is not a prim path.
	pub fn append_property(&self, prop_name: &tf::Token) -> Self {
		if !self.is_prim_path() || !is_property_name(prop_name.as_str()) {
			return Self::empty_path();
		}

		Self {
			absolute: true,
			elements: self.elements.clone(),
			prop: Some(prop_name.clone()),
		}
	}
}

fn is_identifier(name: &str) -> bool {
	let mut chars = name.chars();
	matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
		&& chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_property_name(name: &str) -> bool {
	!name.is_empty() && name.split(':').all(is_identifier)
}

impl Default for Path {
	fn default() -> Self {
		Self::empty_path()
	}
}

impl From<&str> for Path {
	fn from(text: &str) -> Self {
		Self::new(text).unwrap_or_else(|_| Self::empty_path())
	}
}

impl From<&Path> for Path {
	fn from(path: &Path) -> Self {
		path.clone()
	}
}

impl From<String> for Path {
	fn from(text: String) -> Self {
		Self::from(text.as_str())
	}
}

impl std::fmt::Display for Path {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		if self.is_empty() {
			return Ok(());
		}
		if self.elements.is_empty() {
			return write!(f, "/");
		}
		for element in self.elements.iter() {
			write!(f, "/{element}")?;
		}
		if let Some(prop) = &self.prop {
			write!(f, ".{prop}")?;
		}
		Ok(())
	}
}

impl std::fmt::Debug for Path {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "Path(\"{self}\")")
	}
}

pub struct PathAncestorsRange {
	path: Path,
}

impl Iterator for PathAncestorsRange {
	type Item = Path;

	fn next(&mut self) -> Option<Self::Item> {
		if self.path.is_empty() || self.path.is_absolute_root() {
			return None;
		}
		let next = self.path.parent_path();
		Some(std::mem::replace(&mut self.path, next))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeSet;

	fn p(s: &str) -> Path {
		Path::from(s)
	}

	fn t(s: &str) -> tf::Token {
		tf::Token::new(s)
	}

	#[test]
	fn parse() {
		assert_eq!(p("/").to_string(), "/");
		assert_eq!(p("/World/Mesh").to_string(), "/World/Mesh");
		assert_eq!(p("/World/Mesh.primvars:displayColor").to_string(), "/World/Mesh.primvars:displayColor");
		assert!(p("").is_empty());
		assert!(matches!(Path::new("World"), Err(PathError::NotAbsolute(_))));
		assert!(matches!(Path::new("/World//Mesh"), Err(PathError::InvalidElement { .. })));
		assert!(Path::new("/.prop").is_err());
	}

	#[test]
	fn append_child() {
		assert_eq!(p("/foo").append_child(&t("bar")), p("/foo/bar"));
		assert_eq!(Path::absolute_root_path().append_child(&t("foo")), p("/foo"));
		assert_eq!(p("/foo.prop").append_child(&t("bar")), Path::empty_path());
	}

	#[test]
	fn append_property() {
		assert_eq!(p("/foo").append_property(&t("prop")), p("/foo.prop"));
		assert_eq!(
			p("/foo").append_property(&t("prop:foo:bar")),
			p("/foo.prop:foo:bar")
		);
		assert_eq!(
			p("/foo.prop").append_property(&t("prop2")),
			Path::empty_path()
		);
		assert_eq!(
			p("/foo.prop").append_property(&t("proto_Mesh_id0")),
			Path::empty_path()
		);
	}

	#[test]
	fn parent_path() {
		assert_eq!(p("/foo").parent_path(), Path::absolute_root_path());
		assert_eq!(p("/foo/bar").parent_path(), p("/foo"));
		assert_eq!(p("/foo.prop").parent_path(), p("/foo"));
		assert_eq!(p("/foo.prop:bar").parent_path(), p("/foo"));
		assert_eq!(Path::absolute_root_path().parent_path(), Path::empty_path());
	}

	#[test]
	fn ancestors_range() {
		let path = p("/foo/bar/baz");
		let mut ancestors = path.ancestors_range();
		assert_eq!(ancestors.next(), Some(p("/foo/bar/baz")));
		assert_eq!(ancestors.next(), Some(p("/foo/bar")));
		assert_eq!(ancestors.next(), Some(p("/foo")));
		assert_eq!(ancestors.next(), None);

		let path = p("/foo/bar/baz.prop");
		let mut ancestors = path.ancestors_range();
		assert_eq!(ancestors.next(), Some(p("/foo/bar/baz.prop")));
		assert_eq!(ancestors.next(), Some(p("/foo/bar/baz")));
		assert_eq!(ancestors.next(), Some(p("/foo/bar")));
		assert_eq!(ancestors.next(), Some(p("/foo")));
		assert_eq!(ancestors.next(), None);
	}

	#[test]
	fn has_prefix() {
		assert!(p("/foo/bar").has_prefix(&p("/foo")));
		assert!(p("/foo/bar.x").has_prefix(&p("/foo")));
		assert!(p("/foo").has_prefix(&Path::absolute_root_path()));
		assert!(p("/foo.x").has_prefix(&p("/foo.x")));
		assert!(!p("/foo.y").has_prefix(&p("/foo.x")));
		assert!(!p("/foobar").has_prefix(&p("/foo")));
		assert!(!p("/foo").has_prefix(&Path::empty_path()));
	}

	#[test]
	fn replace_prefix() {
		assert_eq!(
			p("/__Prototype_1/cube").replace_prefix(&p("/__Prototype_1"), &p("/World/A")),
			p("/World/A/cube")
		);
		assert_eq!(
			p("/World/B/cube.points").replace_prefix(&p("/World/B"), &p("/World/C")),
			p("/World/C/cube.points")
		);
		assert_eq!(p("/Other").replace_prefix(&p("/World"), &p("/X")), p("/Other"));
	}

	#[test]
	fn subtrees_are_contiguous() {
		let paths: BTreeSet<Path> = ["/a0", "/a/b", "/a", "/a.x", "/a/b/c", "/b", "/a_b"]
			.into_iter()
			.map(p)
			.collect();
		let ordered: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
		let root = p("/a");
		let start = ordered.iter().position(|s| s == "/a").unwrap();
		let in_subtree: Vec<bool> = paths.iter().map(|path| path.has_prefix(&root)).collect();
		assert!(in_subtree[start..start + 4].iter().all(|&b| b));
		assert_eq!(in_subtree.iter().filter(|&&b| b).count(), 4);
	}
}
