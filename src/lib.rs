//! oxbow — reduce a large table to a representative set of exemplar rows.
//!
//! Given a mixed-type table (numeric, boolean, categorical string columns,
//! any cell possibly missing), the engine produces an exemplar table (a row
//! subset with a `members_count` column) and a members table mapping every
//! input row to its exemplar. Dense regions of the input stay covered by
//! nearby exemplars, and every row is traceable to the exemplar that
//! represents it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use arrow::array::{ArrayRef, Float64Array};
//! use arrow::record_batch::RecordBatch;
//! use arrow::datatypes::{DataType, Field, Schema};
//! use oxbow::{Aggregator, AggregatorConfig};
//!
//! let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, true)]));
//! let column: ArrayRef = Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0]));
//! let batch = RecordBatch::try_new(schema, vec![column])?;
//! let out = Aggregator::<f64>::new(AggregatorConfig::default()).aggregate(&batch)?;
//! println!("{} exemplars", out.n_exemplars());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cluster;
pub mod column;
pub mod engine;
pub mod groups;

pub use column::{NumericColumn, Real};
pub use engine::{
    Aggregated, AggregateError, Aggregator, AggregatorConfig, ProgressFn, ProgressStatus,
};
