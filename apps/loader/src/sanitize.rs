//! Column coercion and validity masks.
//!
//! Invalid values never raise: unparseable text, NaN and infinities are
//! reported through the masks and callers drop or null them and log how many.

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type};

use crate::Result;

/// Coerce any column to `Float64`. Text that does not parse becomes null.
pub fn to_numeric(array: &ArrayRef) -> Result<Float64Array> {
    let casted = cast(array, &DataType::Float64)?;
    Ok(casted.as_primitive::<Float64Type>().clone())
}

/// Coerce any column to UTF-8 text (identifiers may be stored as integers).
pub fn to_text(array: &ArrayRef) -> Result<StringArray> {
    let casted = cast(array, &DataType::Utf8)?;
    Ok(casted.as_string::<i32>().clone())
}

/// `true` where the value is present and finite.
pub fn finite_mask(values: &Float64Array) -> Vec<bool> {
    values
        .iter()
        .map(|v| matches!(v, Some(x) if x.is_finite()))
        .collect()
}

/// `true` where the value is present, finite and strictly positive.
pub fn positive_finite_mask(values: &Float64Array) -> Vec<bool> {
    values.iter().map(is_positive_finite).collect()
}

/// Cheap pre-check: does the column hold any strictly positive finite value?
pub fn any_positive_finite(values: &Float64Array) -> bool {
    values.iter().any(is_positive_finite)
}

/// Row positions where `mask` holds.
pub fn positions(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, keep)| keep.then_some(i))
        .collect()
}

/// Element-wise AND of equally long masks.
pub fn and_masks(masks: &[Vec<bool>]) -> Vec<bool> {
    let len = masks.first().map_or(0, Vec::len);
    (0..len).map(|i| masks.iter().all(|m| m[i])).collect()
}

/// Number of `false` entries.
pub fn dropped(mask: &[bool]) -> usize {
    mask.iter().filter(|keep| !**keep).count()
}

/// Value at `row` if it is present and finite.
pub fn finite_at(values: &Float64Array, row: usize) -> Option<f64> {
    if values.is_null(row) {
        return None;
    }
    let v = values.value(row);
    v.is_finite().then_some(v)
}

fn is_positive_finite(value: Option<f64>) -> bool {
    matches!(value, Some(x) if x.is_finite() && x > 0.0)
}
