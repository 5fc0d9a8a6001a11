use std::sync::Arc;

/// Token for efficient comparison, assignment, and hashing of known strings.
///
/// Tokens are shared, so cloning one never copies the underlying text.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token {
	data: Arc<str>,
}

impl Token {
	pub fn new(name: impl AsRef<str>) -> Self {
		Token {
			data: Arc::from(name.as_ref()),
		}
	}

	pub fn empty() -> Self {
		Token::default()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub fn as_str(&self) -> &str {
		&self.data
	}

	/// Return the token with `prefix` removed, or `None` if it does not start with it.
	pub fn strip_prefix(&self, prefix: &str) -> Option<Token> {
		self.data.strip_prefix(prefix).map(Token::new)
	}
}

impl Default for Token {
	fn default() -> Self {
		Token { data: Arc::from("") }
	}
}

impl From<&str> for Token {
	fn from(name: &str) -> Self {
		Token::new(name)
	}
}

impl From<String> for Token {
	fn from(name: String) -> Self {
		Token {
			data: Arc::from(name),
		}
	}
}

impl PartialEq<str> for Token {
	fn eq(&self, other: &str) -> bool {
		&*self.data == other
	}
}

impl PartialEq<&str> for Token {
	fn eq(&self, other: &&str) -> bool {
		&*self.data == *other
	}
}

impl std::fmt::Display for Token {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.data)
	}
}

impl std::fmt::Debug for Token {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?}", &*self.data)
	}
}

macro_rules! declare_public_tokens {
	($struct:ident, $static:ident, [$($name:ident: $value:expr),* $(,)?]) => {
		pub struct $struct {
			$(pub $name: tf::Token,)*
		}

		pub static $static: std::sync::LazyLock<$struct> = std::sync::LazyLock::new(|| {
			$struct {
				$($name: tf::Token::new($value),)*
			}
		});
	};
}

pub(crate) use declare_public_tokens;
