/// A time at which attribute values are evaluated.
///
/// The default time selects an attribute's default value; numeric times
/// select its time samples.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct TimeCode(Option<f64>);

impl TimeCode {
	pub const DEFAULT: TimeCode = TimeCode(None);

	pub const fn new(time: f64) -> Self {
		TimeCode(Some(time))
	}

	pub fn is_default(&self) -> bool {
		self.0.is_none()
	}

	pub fn value(&self) -> Option<f64> {
		self.0
	}
}

impl From<f64> for TimeCode {
	fn from(time: f64) -> Self {
		TimeCode::new(time)
	}
}

impl std::fmt::Display for TimeCode {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self.0 {
			Some(time) => write!(f, "{time}"),
			None => write!(f, "DEFAULT"),
		}
	}
}
