pub mod tf;
pub mod vt;
