use crate::{sdf, tf};
use glam::{DMat4, DQuat, DVec3, Quat, Vec3};

pub type Array<T> = Vec<T>;

/// Type-erased container for any attribute value the stage can hold.
///
/// Matrices are stored as glam column-major [`DMat4`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Value {
	store: ValueStore,
}

impl Value {
	pub fn new<T: ValueType>(value: T) -> Self {
		Value {
			store: value.store(),
		}
	}

	pub fn empty() -> Self {
		Value {
			store: ValueStore::Empty,
		}
	}

	pub fn is_empty(&self) -> bool {
		matches!(self.store, ValueStore::Empty)
	}

	pub fn get<T: ValueType>(&self) -> Option<T> {
		T::load(&self.store)
	}

	pub fn store(&self) -> &ValueStore {
		&self.store
	}

	/// Scene description type name of the held value, e.g. `float3[]`.
	pub fn type_name(&self) -> &'static str {
		use ValueStore::*;
		match &self.store {
			Empty => "",
			Bool(_) => "bool",
			BoolArray(_) => "bool[]",
			Int(_) => "int",
			IntArray(_) => "int[]",
			Float(_) => "float",
			FloatArray(_) => "float[]",
			Double(_) => "double",
			DoubleArray(_) => "double[]",
			Vec3f(_) => "float3",
			Vec3fArray(_) => "float3[]",
			Vec3d(_) => "double3",
			Vec3dArray(_) => "double3[]",
			Quatf(_) => "quatf",
			Quatd(_) => "quatd",
			Matrix4d(_) => "matrix4d",
			Matrix4dArray(_) => "matrix4d[]",
			Token(_) => "token",
			TokenArray(_) => "token[]",
			String(_) => "string",
			Path(_) => "path",
			PathArray(_) => "path[]",
		}
	}

	/// Number of elements for array values, 1 for scalars and 0 when empty.
	pub fn array_len(&self) -> usize {
		use ValueStore::*;
		match &self.store {
			Empty => 0,
			BoolArray(v) => v.len(),
			IntArray(v) => v.len(),
			FloatArray(v) => v.len(),
			DoubleArray(v) => v.len(),
			Vec3fArray(v) => v.len(),
			Vec3dArray(v) => v.len(),
			Matrix4dArray(v) => v.len(),
			TokenArray(v) => v.len(),
			PathArray(v) => v.len(),
			_ => 1,
		}
	}

	/// Build an array value with one element per entry of `elements`.
	///
	/// Array-valued entries contribute their first element; missing entries
	/// take the element type's default. The element type is taken from the
	/// first present entry, and `None` is returned when every entry is missing.
	pub fn gather_elements(elements: &[Option<Value>]) -> Option<Value> {
		macro_rules! gather {
			($scalar:ty) => {
				Value::from(
					elements
						.iter()
						.map(|element| {
							element
								.as_ref()
								.and_then(|v| {
									v.get::<$scalar>()
										.or_else(|| v.get::<Array<$scalar>>().and_then(|a| a.first().cloned()))
								})
								.unwrap_or_default()
						})
						.collect::<Array<$scalar>>(),
				)
			};
		}

		let first = elements.iter().flatten().next()?;
		use ValueStore::*;
		Some(match &first.store {
			Bool(_) | BoolArray(_) => gather!(bool),
			Int(_) | IntArray(_) => gather!(i32),
			Float(_) | FloatArray(_) => gather!(f32),
			Double(_) | DoubleArray(_) => gather!(f64),
			Vec3f(_) | Vec3fArray(_) => gather!(Vec3),
			Vec3d(_) | Vec3dArray(_) => gather!(DVec3),
			Matrix4d(_) | Matrix4dArray(_) => gather!(DMat4),
			Token(_) | TokenArray(_) => gather!(tf::Token),
			Path(_) | PathArray(_) => gather!(sdf::Path),
			Empty | Quatf(_) | Quatd(_) | String(_) => return None,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ValueStore {
	#[default]
	Empty,

	Bool(bool),
	BoolArray(Array<bool>),

	Int(i32),
	IntArray(Array<i32>),

	Float(f32),
	FloatArray(Array<f32>),
	Double(f64),
	DoubleArray(Array<f64>),

	Vec3f(Vec3),
	Vec3fArray(Array<Vec3>),
	Vec3d(DVec3),
	Vec3dArray(Array<DVec3>),

	Quatf(Quat),
	Quatd(DQuat),

	Matrix4d(DMat4),
	Matrix4dArray(Array<DMat4>),

	Token(tf::Token),
	TokenArray(Array<tf::Token>),

	String(String),

	Path(sdf::Path),
	PathArray(Array<sdf::Path>),
}

pub trait ValueType {
	fn load(store: &ValueStore) -> Option<Self>
	where
		Self: Sized;
	fn store(self) -> ValueStore;
}

macro_rules! impl_value_type_clone {
	($type:ty, $store:ident) => {
		impl ValueType for $type {
			fn load(store: &ValueStore) -> Option<Self> {
				match store {
					ValueStore::$store(v) => Some(v.clone()),
					_ => None,
				}
			}

			fn store(self) -> ValueStore {
				ValueStore::$store(self)
			}
		}

		impl From<$type> for Value {
			fn from(value: $type) -> Self {
				Value {
					store: ValueStore::$store(value),
				}
			}
		}
	};
}

macro_rules! impl_value_type_deref {
	($type:ty, $store:ident) => {
		impl ValueType for $type {
			fn load(store: &ValueStore) -> Option<Self> {
				match store {
					ValueStore::$store(v) => Some(*v),
					_ => None,
				}
			}

			fn store(self) -> ValueStore {
				ValueStore::$store(self)
			}
		}

		impl From<$type> for Value {
			fn from(value: $type) -> Self {
				Value {
					store: ValueStore::$store(value),
				}
			}
		}
	};
}

impl_value_type_deref!(bool, Bool);
impl_value_type_clone!(Array<bool>, BoolArray);

impl_value_type_deref!(i32, Int);
impl_value_type_clone!(Array<i32>, IntArray);

impl_value_type_deref!(f32, Float);
impl_value_type_clone!(Array<f32>, FloatArray);
impl_value_type_deref!(f64, Double);
impl_value_type_clone!(Array<f64>, DoubleArray);

impl_value_type_deref!(Vec3, Vec3f);
impl_value_type_clone!(Array<Vec3>, Vec3fArray);
impl_value_type_deref!(DVec3, Vec3d);
impl_value_type_clone!(Array<DVec3>, Vec3dArray);

impl_value_type_deref!(Quat, Quatf);
impl_value_type_deref!(DQuat, Quatd);

impl_value_type_deref!(DMat4, Matrix4d);
impl_value_type_clone!(Array<DMat4>, Matrix4dArray);

impl_value_type_clone!(tf::Token, Token);
impl_value_type_clone!(Array<tf::Token>, TokenArray);

impl_value_type_clone!(String, String);

impl_value_type_clone!(sdf::Path, Path);
impl_value_type_clone!(Array<sdf::Path>, PathArray);

impl From<&str> for Value {
	fn from(value: &str) -> Self {
		Value::from(value.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn typed_access() {
		let value = Value::new(2.5f32);
		assert_eq!(value.get::<f32>(), Some(2.5));
		assert_eq!(value.get::<f64>(), None);
		assert_eq!(value.type_name(), "float");
		assert!(Value::empty().is_empty());
		assert_eq!(Value::from(vec![Vec3::ONE]).type_name(), "float3[]");
	}

	#[test]
	fn gather_elements_fills_missing_with_default() {
		let elements = [
			Some(Value::from(vec![Vec3::X, Vec3::Y])),
			None,
			Some(Value::from(Vec3::Z)),
		];
		let gathered = Value::gather_elements(&elements).unwrap();
		assert_eq!(gathered.get::<Array<Vec3>>(), Some(vec![Vec3::X, Vec3::ZERO, Vec3::Z]));
		assert_eq!(Value::gather_elements(&[None, None]), None);
	}
}
