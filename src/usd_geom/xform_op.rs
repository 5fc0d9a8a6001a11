use super::TOKENS;
use crate::{tf, usd};
use glam::{DMat4, DQuat, DVec3, Quat, Vec3, dvec3};

const XFORM_OP_PREFIX: &str = "xformOp:";
const INVERSE_PREFIX: &str = "!invert!";

pub enum XformOpType {
	// Scalar
	TranslateX,
	TranslateY,
	TranslateZ,
	// Vec3
	Translate,

	// Scalar
	ScaleX,
	ScaleY,
	ScaleZ,
	// Vec3
	Scale,

	// Scalar
	RotateX,
	RotateY,
	RotateZ,

	// Vec3
	RotateXYZ,
	RotateXZY,
	RotateYXZ,
	RotateYZX,
	RotateZXY,
	RotateZYX,

	// Quat
	Orient,

	// Matrix4
	Transform,
}

impl TryFrom<&str> for XformOpType {
	type Error = ();
	fn try_from(s: &str) -> Result<Self, Self::Error> {
		Ok(match s {
			"translateX" => XformOpType::TranslateX,
			"translateY" => XformOpType::TranslateY,
			"translateZ" => XformOpType::TranslateZ,
			"translate" => XformOpType::Translate,
			"scaleX" => XformOpType::ScaleX,
			"scaleY" => XformOpType::ScaleY,
			"scaleZ" => XformOpType::ScaleZ,
			"scale" => XformOpType::Scale,
			"rotateX" => XformOpType::RotateX,
			"rotateY" => XformOpType::RotateY,
			"rotateZ" => XformOpType::RotateZ,
			"rotateXYZ" => XformOpType::RotateXYZ,
			"rotateXZY" => XformOpType::RotateXZY,
			"rotateYXZ" => XformOpType::RotateYXZ,
			"rotateYZX" => XformOpType::RotateYZX,
			"rotateZXY" => XformOpType::RotateZXY,
			"rotateZYX" => XformOpType::RotateZYX,
			"orient" => XformOpType::Orient,
			"transform" => XformOpType::Transform,
			_ => return Err(()),
		})
	}
}

/// Schema wrapper for [`usd::Attribute`] for computing transformation
/// operations, as consumed by the Xformable schema.
///
/// Rotation values are in degrees. Matrices compose in column-vector order,
/// so the first op in `xformOpOrder` is the outermost.
pub struct XformOp {}

impl XformOp {
	/// Return true if an edit to the attribute `name` can change a prim's local transform.
	pub fn is_transformation_affected_by_attr_named(name: &tf::Token) -> bool {
		*name == TOKENS.xform_op_order || name.as_str().starts_with(XFORM_OP_PREFIX)
	}

	fn get_op_transform(op_type: XformOpType, value: crate::vt::Value, is_inverse: bool) -> Option<DMat4> {
		use XformOpType::*;

		let get_scalar = || -> Option<f64> {
			value
				.get::<f64>()
				.or_else(|| value.get::<f32>().map(f64::from))
		};

		let get_vec3 = || -> Option<DVec3> {
			value
				.get::<DVec3>()
				.or_else(|| value.get::<Vec3>().map(|v| v.as_dvec3()))
		};

		let get_angle = || get_scalar().map(f64::to_radians);

		let get_quat = || -> Option<DQuat> {
			value
				.get::<DQuat>()
				.or_else(|| value.get::<Quat>().map(|v| v.as_dquat()))
		};

		let matrix = match op_type {
			TranslateX => DMat4::from_translation(dvec3(get_scalar()?, 0.0, 0.0)),
			TranslateY => DMat4::from_translation(dvec3(0.0, get_scalar()?, 0.0)),
			TranslateZ => DMat4::from_translation(dvec3(0.0, 0.0, get_scalar()?)),
			Translate => DMat4::from_translation(get_vec3()?),

			ScaleX => DMat4::from_scale(dvec3(get_scalar()?, 1.0, 1.0)),
			ScaleY => DMat4::from_scale(dvec3(1.0, get_scalar()?, 1.0)),
			ScaleZ => DMat4::from_scale(dvec3(1.0, 1.0, get_scalar()?)),
			Scale => DMat4::from_scale(get_vec3()?),

			RotateX => DMat4::from_rotation_x(get_angle()?),
			RotateY => DMat4::from_rotation_y(get_angle()?),
			RotateZ => DMat4::from_rotation_z(get_angle()?),

			RotateXYZ | RotateXZY | RotateYXZ | RotateYZX | RotateZXY | RotateZYX => {
				let vec = get_vec3()?;

				let rot_x = DQuat::from_axis_angle(DVec3::X, vec.x.to_radians());
				let rot_y = DQuat::from_axis_angle(DVec3::Y, vec.y.to_radians());
				let rot_z = DQuat::from_axis_angle(DVec3::Z, vec.z.to_radians());

				// The named axis order is the order rotations apply to a point.
				let rot = match op_type {
					RotateXYZ => rot_z * rot_y * rot_x,
					RotateXZY => rot_y * rot_z * rot_x,
					RotateYXZ => rot_z * rot_x * rot_y,
					RotateYZX => rot_x * rot_z * rot_y,
					RotateZXY => rot_y * rot_x * rot_z,
					RotateZYX => rot_x * rot_y * rot_z,
					_ => unreachable!(),
				};

				DMat4::from_quat(rot)
			}
			Orient => DMat4::from_quat(get_quat()?),
			Transform => value.get::<DMat4>()?,
		};

		Some(if is_inverse { matrix.inverse() } else { matrix })
	}

	fn op_order(prim: &usd::Prim, time: usd::TimeCode) -> Vec<tf::Token> {
		prim.attribute(&TOKENS.xform_op_order)
			.get_typed::<Vec<tf::Token>>(time)
			.unwrap_or_default()
	}

	/// Return true if the prim's op order discards the parent transform.
	pub fn resets_xform_stack(prim: &usd::Prim) -> bool {
		Self::op_order(prim, usd::TimeCode::DEFAULT)
			.first()
			.is_some_and(|op| *op == TOKENS.reset_xform_stack)
	}

	/// Compose the prim's local transform at `time`. Prims without an op
	/// order have an identity transform.
	pub fn local_transform(prim: &usd::Prim, time: usd::TimeCode) -> DMat4 {
		let mut matrix = DMat4::IDENTITY;

		for op in Self::op_order(prim, time) {
			if op == TOKENS.reset_xform_stack {
				continue;
			}

			let (attr_name, is_inverse) = match op.strip_prefix(INVERSE_PREFIX) {
				Some(name) => (name, true),
				None => (op.clone(), false),
			};

			let Some(op_type) = attr_name
				.as_str()
				.strip_prefix(XFORM_OP_PREFIX)
				.and_then(|name| name.split(':').next())
				.and_then(|name| XformOpType::try_from(name).ok())
			else {
				log::warn!("Unsupported xform op `{}` on <{}>", attr_name, prim.path());
				continue;
			};

			if let Some(op_value) = prim.attribute(&attr_name).get(time)
				&& let Some(mat) = Self::get_op_transform(op_type, op_value, is_inverse)
			{
				matrix *= mat;
			}
		}

		matrix
	}

	/// Attributes contributing to the prim's local transform.
	pub fn op_attributes<'a>(prim: &usd::Prim<'a>) -> Vec<usd::Attribute<'a>> {
		let mut attrs = vec![prim.attribute(&TOKENS.xform_op_order)];
		for op in Self::op_order(prim, usd::TimeCode::DEFAULT) {
			let name = op.strip_prefix(INVERSE_PREFIX).unwrap_or(op);
			if name.as_str().starts_with(XFORM_OP_PREFIX) {
				attrs.push(prim.attribute(&name));
			}
		}
		attrs
	}

	pub fn local_transform_might_be_time_varying(prim: &usd::Prim) -> bool {
		Self::op_attributes(prim)
			.iter()
			.any(|attr| attr.might_be_time_varying())
	}
}
