//! Typed floating-point views over heterogeneous Arrow columns.
//!
//! The aggregation engine treats every numeric-ish source column (booleans,
//! integers of any width, floats of any width) as a lazy sequence of `T`
//! values, where `T` is the precision all distance arithmetic runs in.
//! [`NumericColumn`] provides that view: `value(i)` casts on access, missing
//! cells surface as NaN, and the column min/max over non-missing values is
//! computed once at construction.

use std::fmt;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array,
    Int64Array,
};
use arrow::datatypes::DataType;
use num_traits::Float;
use rand::Rng;
use rand_distr::StandardNormal;

/// Floating-point precision the engine is instantiated with.
///
/// Implemented for `f32` and `f64`. Everything the engine needs beyond
/// `num_traits::Float` lives here as concrete methods so that generic code
/// never has to thread fallible conversions around.
pub trait Real: Float + Send + Sync + fmt::Debug + fmt::Display + 'static {
    /// Lossy cast from a count (row count, dimension count).
    fn from_usize(n: usize) -> Self;

    /// Lossy cast from `f64`.
    fn from_f64(v: f64) -> Self;

    /// Truncating cast to `i32`. Callers guarantee the value is a small
    /// non-negative bin coordinate.
    fn trunc_i32(self) -> i32;

    /// Draw one standard-normal variate in this precision.
    fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> Self;
}

impl Real for f32 {
    fn from_usize(n: usize) -> Self {
        n as f32
    }

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn trunc_i32(self) -> i32 {
        self as i32
    }

    fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.sample(StandardNormal)
    }
}

impl Real for f64 {
    fn from_usize(n: usize) -> Self {
        n as f64
    }

    fn from_f64(v: f64) -> Self {
        v
    }

    fn trunc_i32(self) -> i32 {
        self as i32
    }

    fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.sample(StandardNormal)
    }
}

/// Concrete array behind a [`NumericColumn`]. One variant per accepted
/// source type; the clone at construction is an `Arc` bump, not a copy.
enum Values {
    Bool(BooleanArray),
    Int8(Int8Array),
    Int16(Int16Array),
    Int32(Int32Array),
    Int64(Int64Array),
    Float32(Float32Array),
    Float64(Float64Array),
}

/// Uniform `T`-typed view over one numeric source column.
pub struct NumericColumn<T: Real> {
    values: Values,
    nrows: usize,
    min: T,
    max: T,
}

impl<T: Real> NumericColumn<T> {
    /// Wrap an Arrow array if its type is numeric, returning `None` for
    /// strings and anything else the engine treats as categorical.
    ///
    /// Min/max are computed here over non-missing values; a wholly-missing
    /// column yields `min == max == 0` and is handled downstream as a
    /// constant column.
    pub fn from_array(array: &ArrayRef) -> Option<Self> {
        let values = match array.data_type() {
            DataType::Boolean => Values::Bool(as_typed::<BooleanArray>(array)),
            DataType::Int8 => Values::Int8(as_typed::<Int8Array>(array)),
            DataType::Int16 => Values::Int16(as_typed::<Int16Array>(array)),
            DataType::Int32 => Values::Int32(as_typed::<Int32Array>(array)),
            DataType::Int64 => Values::Int64(as_typed::<Int64Array>(array)),
            DataType::Float32 => Values::Float32(as_typed::<Float32Array>(array)),
            DataType::Float64 => Values::Float64(as_typed::<Float64Array>(array)),
            _ => return None,
        };

        let nrows = array.len();
        let mut column = Self {
            values,
            nrows,
            min: T::zero(),
            max: T::zero(),
        };

        let mut min = T::infinity();
        let mut max = T::neg_infinity();
        let mut seen = false;
        for i in 0..nrows {
            let v = column.value(i);
            if v.is_nan() {
                continue;
            }
            seen = true;
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }
        if seen {
            column.min = min;
            column.max = max;
        }
        Some(column)
    }

    /// Number of rows in the column.
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Minimum over non-missing values (0 for a wholly-missing column).
    pub fn min(&self) -> T {
        self.min
    }

    /// Maximum over non-missing values (0 for a wholly-missing column).
    pub fn max(&self) -> T {
        self.max
    }

    /// Value at row `i`, cast to `T`. Missing cells come back as NaN.
    #[inline]
    pub fn value(&self, i: usize) -> T {
        match &self.values {
            Values::Bool(a) => {
                if a.is_null(i) {
                    T::nan()
                } else if a.value(i) {
                    T::one()
                } else {
                    T::zero()
                }
            }
            Values::Int8(a) => prim_value(a.is_null(i), a.value(i) as f64),
            Values::Int16(a) => prim_value(a.is_null(i), a.value(i) as f64),
            Values::Int32(a) => prim_value(a.is_null(i), a.value(i) as f64),
            Values::Int64(a) => prim_value(a.is_null(i), a.value(i) as f64),
            Values::Float32(a) => prim_value(a.is_null(i), a.value(i) as f64),
            Values::Float64(a) => prim_value(a.is_null(i), a.value(i)),
        }
    }

    /// Whether the cell at row `i` is missing.
    #[inline]
    pub fn is_missing(&self, i: usize) -> bool {
        match &self.values {
            Values::Bool(a) => a.is_null(i),
            Values::Int8(a) => a.is_null(i),
            Values::Int16(a) => a.is_null(i),
            Values::Int32(a) => a.is_null(i),
            Values::Int64(a) => a.is_null(i),
            Values::Float32(a) => a.is_null(i) || a.value(i).is_nan(),
            Values::Float64(a) => a.is_null(i) || a.value(i).is_nan(),
        }
    }
}

#[inline]
fn prim_value<T: Real>(is_null: bool, v: f64) -> T {
    if is_null { T::nan() } else { T::from_f64(v) }
}

fn as_typed<A: Clone + 'static>(array: &ArrayRef) -> A {
    // Caller matched on the data type, so the downcast cannot fail.
    array
        .as_any()
        .downcast_ref::<A>()
        .expect("array type matches its DataType")
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn float_column_min_max_skips_nulls() {
        let array: ArrayRef = Arc::new(Float64Array::from(vec![
            Some(3.0),
            None,
            Some(-1.5),
            Some(7.25),
        ]));
        let col = NumericColumn::<f64>::from_array(&array).expect("numeric");
        assert_eq!(col.nrows(), 4);
        assert_eq!(col.min(), -1.5);
        assert_eq!(col.max(), 7.25);
        assert!(col.value(1).is_nan());
        assert!(col.is_missing(1));
        assert!(!col.is_missing(0));
    }

    #[test]
    fn bool_column_maps_to_zero_one() {
        let array: ArrayRef = Arc::new(BooleanArray::from(vec![
            Some(true),
            Some(false),
            None,
        ]));
        let col = NumericColumn::<f32>::from_array(&array).expect("numeric");
        assert_eq!(col.value(0), 1.0);
        assert_eq!(col.value(1), 0.0);
        assert!(col.value(2).is_nan());
        assert_eq!(col.min(), 0.0);
        assert_eq!(col.max(), 1.0);
    }

    #[test]
    fn wholly_missing_column_is_constant_zero() {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![None, None, None]));
        let col = NumericColumn::<f64>::from_array(&array).expect("numeric");
        assert_eq!(col.min(), 0.0);
        assert_eq!(col.max(), 0.0);
    }

    #[test]
    fn string_column_is_not_numeric() {
        let array: ArrayRef = Arc::new(arrow::array::StringArray::from(vec!["a", "b"]));
        assert!(NumericColumn::<f64>::from_array(&array).is_none());
    }

    #[test]
    fn integer_widths_cast_exactly() {
        let array: ArrayRef = Arc::new(Int64Array::from(vec![Some(-42), Some(1_000_000)]));
        let col = NumericColumn::<f64>::from_array(&array).expect("numeric");
        assert_eq!(col.value(0), -42.0);
        assert_eq!(col.value(1), 1_000_000.0);
    }
}
