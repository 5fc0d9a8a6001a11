use super::{TOKENS, XformOp};
use crate::{tf, usd};
use glam::DMat4;

/// Iterate `prim` and its ancestors, stopping before the pseudo root.
fn self_and_ancestors<'a>(prim: &usd::Prim<'a>) -> impl Iterator<Item = usd::Prim<'a>> {
	std::iter::successors(Some(prim.clone()), |prim| prim.parent()).take_while(|prim| !prim.is_pseudo_root())
}

/// Computed visibility at `time`: a prim is invisible if it or any ancestor
/// authors `visibility = invisible`.
pub fn compute_visibility(prim: &usd::Prim, time: usd::TimeCode) -> bool {
	!self_and_ancestors(prim).any(|prim| {
		prim.attribute(&TOKENS.visibility)
			.get_typed::<tf::Token>(time)
			.is_some_and(|vis| vis == TOKENS.invisible)
	})
}

/// Return true if the visibility of `prim` or any ancestor is animated.
pub fn visibility_might_be_time_varying(prim: &usd::Prim) -> bool {
	self_and_ancestors(prim).any(|prim| prim.attribute(&TOKENS.visibility).might_be_time_varying())
}

/// The nearest authored purpose on `prim` or its ancestors.
pub fn authored_purpose(prim: &usd::Prim) -> Option<tf::Token> {
	self_and_ancestors(prim).find_map(|prim| {
		prim.attribute(&TOKENS.purpose)
			.get_typed::<tf::Token>(usd::TimeCode::DEFAULT)
	})
}

/// The nearest authored purpose on `prim` or its ancestors, or `default`.
pub fn compute_purpose(prim: &usd::Prim) -> tf::Token {
	authored_purpose(prim).unwrap_or_else(|| TOKENS.default_.clone())
}

/// The nearest authored `model:drawMode` on `prim` or its ancestors, or `default`.
pub fn compute_draw_mode(prim: &usd::Prim) -> tf::Token {
	self_and_ancestors(prim)
		.find_map(|prim| {
			prim.attribute(&TOKENS.model_draw_mode)
				.get_typed::<tf::Token>(usd::TimeCode::DEFAULT)
		})
		.unwrap_or_else(|| TOKENS.default_.clone())
}

/// Compose the transform from `prim`'s space to the space of its namespace
/// root. Prims inside a prototype resolve relative to the prototype root.
pub fn compute_local_to_world(prim: &usd::Prim, time: usd::TimeCode) -> DMat4 {
	let mut matrix = DMat4::IDENTITY;
	for prim in self_and_ancestors(prim) {
		matrix = XformOp::local_transform(&prim, time) * matrix;
		if XformOp::resets_xform_stack(&prim) {
			break;
		}
	}
	matrix
}

/// Return true if any transform contributing to `prim`'s world transform is animated.
pub fn transform_might_be_time_varying(prim: &usd::Prim) -> bool {
	for prim in self_and_ancestors(prim) {
		if XformOp::local_transform_might_be_time_varying(&prim) {
			return true;
		}
		if XformOp::resets_xform_stack(&prim) {
			break;
		}
	}
	false
}

/// Union of the transform sample times of `prim` and its ancestors within `[start, end]`.
pub fn transform_time_samples_in_interval(prim: &usd::Prim, start: f64, end: f64) -> Vec<f64> {
	let mut times = Vec::new();
	for prim in self_and_ancestors(prim) {
		for attr in XformOp::op_attributes(&prim) {
			times.extend(attr.time_samples_in_interval(start, end));
		}
		if XformOp::resets_xform_stack(&prim) {
			break;
		}
	}
	times.sort_by(f64::total_cmp);
	times.dedup();
	times
}
