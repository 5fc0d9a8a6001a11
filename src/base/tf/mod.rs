mod token;

pub use token::Token;
pub(crate) use token::declare_public_tokens;
