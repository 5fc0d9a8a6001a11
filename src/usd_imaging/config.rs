use super::{ImagingError, Result};
use crate::sdf;
use serde::{Deserialize, Serialize};

/// Delegate settings, loadable from TOML.
///
/// ```toml
/// worker_threads = 4
/// scene_lights_enabled = false
/// excluded_paths = ["/World/Proxy"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
	/// Size of the worker pool. `None` lets rayon choose.
	pub worker_threads: Option<usize>,
	pub scene_materials_enabled: bool,
	pub scene_lights_enabled: bool,
	pub draw_modes_enabled: bool,
	/// Subtrees pruned from population.
	pub excluded_paths: Vec<String>,
	/// Subtrees forced invisible.
	pub invised_paths: Vec<String>,
	pub root_visible: bool,
	pub display_guides: bool,
}

impl Default for DelegateConfig {
	fn default() -> Self {
		Self {
			worker_threads: None,
			scene_materials_enabled: true,
			scene_lights_enabled: true,
			draw_modes_enabled: true,
			excluded_paths: Vec::new(),
			invised_paths: Vec::new(),
			root_visible: true,
			display_guides: false,
		}
	}
}

impl DelegateConfig {
	pub fn from_toml_str(text: &str) -> Result<Self> {
		toml::from_str(text).map_err(ImagingError::Config)
	}

	pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
		let contents = std::fs::read_to_string(path)?;
		Self::from_toml_str(&contents)
	}

	pub(crate) fn parse_paths(paths: &[String]) -> Vec<sdf::Path> {
		paths
			.iter()
			.filter_map(|text| match sdf::Path::new(text) {
				Ok(path) if !path.is_empty() => Some(path),
				Ok(_) => None,
				Err(err) => {
					log::warn!("Ignoring configured path: {err}");
					None
				}
			})
			.collect()
	}

	pub(crate) fn excluded(&self) -> Vec<sdf::Path> {
		Self::parse_paths(&self.excluded_paths)
	}

	pub(crate) fn invised(&self) -> Vec<sdf::Path> {
		Self::parse_paths(&self.invised_paths)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_fill_missing_fields() {
		let config = DelegateConfig::from_toml_str("worker_threads = 2\nscene_lights_enabled = false\n").unwrap();
		assert_eq!(config.worker_threads, Some(2));
		assert!(!config.scene_lights_enabled);
		assert!(config.scene_materials_enabled);
		assert!(config.root_visible);
	}

	#[test]
	fn paths_are_parsed() {
		let config = DelegateConfig::from_toml_str("excluded_paths = [\"/World/Proxy\", \"relative\"]").unwrap();
		assert_eq!(config.excluded(), vec![sdf::Path::from("/World/Proxy")]);
	}

	#[test]
	fn malformed_toml_is_a_config_error() {
		let err = DelegateConfig::from_toml_str("worker_threads = \"many\"").unwrap_err();
		assert!(matches!(err, ImagingError::Config(_)));
	}

	#[test]
	fn round_trips_through_toml() {
		let config = DelegateConfig {
			invised_paths: vec!["/World/Hidden".to_string()],
			..Default::default()
		};
		let text = toml::to_string(&config).unwrap();
		assert_eq!(DelegateConfig::from_toml_str(&text).unwrap(), config);
	}
}
