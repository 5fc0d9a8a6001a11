use crate::sdf;

/// Misuse of the delegate API. Scene-data problems found while
/// synchronizing are logged instead and never surface here.
#[derive(thiserror::Error, Debug)]
pub enum ImagingError {
	#[error("delegate has already been populated")]
	AlreadyPopulated,

	#[error("root prim <{0}> does not exist on the stage")]
	InvalidRootPrim(sdf::Path),

	#[error("failed to build worker pool: {0}")]
	ThreadPool(#[from] rayon::ThreadPoolBuildError),

	#[error("invalid delegate configuration: {0}")]
	Config(#[from] toml::de::Error),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T, E = ImagingError> = std::result::Result<T, E>;
