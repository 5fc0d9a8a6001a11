use super::{Stage, TimeCode};
use crate::{
	sdf, tf,
	vt::{self, ValueType},
};

/// Scenegraph object for authoring and retrieving numeric, string, and array valued data, sampled over time.
#[derive(Clone)]
pub struct Attribute<'a> {
	stage: &'a Stage,
	path: sdf::Path,
	spec_path: sdf::Path,
}

impl<'a> Attribute<'a> {
	pub(crate) fn new(stage: &'a Stage, path: sdf::Path, spec_path: sdf::Path) -> Self {
		Attribute { stage, path, spec_path }
	}

	pub fn stage(&self) -> &'a Stage {
		self.stage
	}

	pub fn path(&self) -> &sdf::Path {
		&self.path
	}

	pub fn name(&self) -> tf::Token {
		self.path.name_token()
	}

	/// Return true if the attribute is authored.
	pub fn is_valid(&self) -> bool {
		self.stage.with_attribute(&self.spec_path, |_| ()).is_some()
	}

	/// Return true if the attribute has a default value or time samples.
	pub fn has_value(&self) -> bool {
		self.stage
			.with_attribute(&self.spec_path, |attr| attr.default.is_some() || !attr.samples.is_empty())
			.unwrap_or(false)
	}

	/// Resolve the value at `time`.
	///
	/// Numeric times read time samples with held interpolation, falling back
	/// to the default value when the attribute has no samples.
	pub fn get(&self, time: TimeCode) -> Option<vt::Value> {
		self.stage
			.with_attribute(&self.spec_path, |attr| match time.value() {
				Some(t) if !attr.samples.is_empty() => {
					let held = attr.samples.partition_point(|(sample, _)| *sample <= t);
					Some(attr.samples[held.saturating_sub(1)].1.clone())
				}
				_ => attr
					.default
					.clone()
					.or_else(|| attr.samples.first().map(|(_, value)| value.clone())),
			})
			.flatten()
	}

	/// The authored default value, ignoring time samples.
	pub fn get_default(&self) -> Option<vt::Value> {
		self.stage
			.with_attribute(&self.spec_path, |attr| attr.default.clone())
			.flatten()
	}

	pub fn get_typed<T: ValueType>(&self, time: TimeCode) -> Option<T> {
		self.get(time).and_then(|value| value.get::<T>())
	}

	pub fn type_name(&self) -> tf::Token {
		self.get(TimeCode::DEFAULT)
			.map(|value| tf::Token::new(value.type_name()))
			.unwrap_or_default()
	}

	pub fn metadata<T: ValueType>(&self, key: &tf::Token) -> Option<T> {
		self.stage
			.with_attribute(&self.spec_path, |attr| attr.metadata.get(key).and_then(|v| v.get::<T>()))
			.flatten()
	}

	pub fn time_samples(&self) -> Vec<f64> {
		self.stage
			.with_attribute(&self.spec_path, |attr| attr.samples.iter().map(|(t, _)| *t).collect())
			.unwrap_or_default()
	}

	/// Sample times within the closed interval `[start, end]`.
	pub fn time_samples_in_interval(&self, start: f64, end: f64) -> Vec<f64> {
		self.time_samples()
			.into_iter()
			.filter(|t| *t >= start && *t <= end)
			.collect()
	}

	/// Return true if the attribute has more than one time sample.
	pub fn might_be_time_varying(&self) -> bool {
		self.stage
			.with_attribute(&self.spec_path, |attr| attr.samples.len() > 1)
			.unwrap_or(false)
	}
}

impl std::fmt::Debug for Attribute<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "Attribute(<{}>)", self.path)
	}
}
