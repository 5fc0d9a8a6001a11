//! In-memory composed scene: prims, attributes, instancing and change notices.

mod attribute;
mod notice;
mod prim;
mod stage;
mod time_code;

pub use attribute::*;
pub use notice::*;
pub use prim::*;
pub use stage::*;
pub use time_code::*;
