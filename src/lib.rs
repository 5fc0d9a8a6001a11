//! Incremental synchronization of an [OpenUSD](https://github.com/PixarAnimationStudios/OpenUSD)-style
//! stage into a retained-mode render index, in pure Rust

pub mod base;
pub mod hd;
pub mod sdf;
pub mod usd;

pub mod usd_geom;
pub mod usd_imaging;
pub mod usd_shade;

#[doc(hidden)]
pub use base::*;

pub(crate) use tf::declare_public_tokens;
