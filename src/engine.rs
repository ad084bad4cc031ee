//! Aggregation engine: dispatch, binning, sampling, finalization.
//!
//! [`Aggregator::aggregate`] reduces an input table to an exemplar table (a
//! row subset with an appended `members_count` column) and a members table
//! (one `exemplar_id` per input row). The shape of the column mix picks the
//! strategy: no columns or too few rows degrade to a plain sort, one or two
//! columns are binned or grouped directly, three or more numeric columns go
//! through the concurrent clustering pass in [`crate::cluster`].
//!
//! Internally a row's group is a working `i32` code: `i32::MIN` marks a
//! missing assignment, and the 2-D paths use −1/−2/−3 to segregate the three
//! missing-value classes. Finalization renumbers everything to compact
//! non-negative exemplar ids.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use arrow::array::{Array, ArrayRef, Int32Array, UInt32Array};
use arrow::compute::{SortOptions, sort_to_indices, take};
use arrow::datatypes::{DataType, Field, FieldRef, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use rand::prelude::*;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cluster::{self, NdParams, NormCoeffs};
use crate::column::{NumericColumn, Real};
use crate::groups::RowGroups;

/// Working sentinel for "no assignment yet / discarded by sampling".
/// Sorts below every real code, so the NA group is always group 0.
const NA: i32 = i32::MIN;

// ============================================================================
// Progress reporting
// ============================================================================

/// Status code delivered alongside each progress fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProgressStatus {
    Running = 0,
    Done = 1,
    Error = 2,
    Interrupt = 3,
}

/// Progress callback: `(fraction ∈ [0, 1], status)`.
pub type ProgressFn = Arc<dyn Fn(f32, ProgressStatus) + Send + Sync>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum AggregateError {
    /// The column type mix is not supported by the selected path.
    #[error("schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Arrow(#[from] ArrowError),

    /// The cancel flag was raised while workers were running.
    #[error("aggregation was interrupted")]
    Interrupted,

    #[error("a worker thread panicked during aggregation")]
    WorkerPanic,
}

// ============================================================================
// Configuration
// ============================================================================

/// Tuning knobs for the aggregation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Tables with fewer rows than this are not aggregated at all; every row
    /// becomes its own exemplar, ordered by the first column.
    pub min_rows: usize,
    /// Bin count for a single continuous column.
    pub n_bins: usize,
    /// Per-axis bin counts for the two-column paths.
    pub nx_bins: usize,
    pub ny_bins: usize,
    /// Target upper bound on exemplars in the general path; also the cap the
    /// sampler enforces when any path produced too many groups.
    pub nd_max_bins: usize,
    /// Coordinate count above which rows are Gaussian-projected down.
    pub max_dimensions: usize,
    /// Run seed; 0 draws one from OS entropy.
    pub seed: u32,
    /// Worker thread count for the general path; 0 uses the host parallelism.
    /// Always clamped to the row count.
    pub nthreads: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_rows: 500,
            n_bins: 500,
            nx_bins: 50,
            ny_bins: 50,
            nd_max_bins: 500,
            max_dimensions: 50,
            seed: 0,
            nthreads: 0,
        }
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Result of one aggregation call.
#[derive(Debug)]
pub struct Aggregated {
    /// One row per retained exemplar: the input schema plus a trailing
    /// non-nullable `members_count` Int32 column.
    pub exemplars: RecordBatch,
    /// Single nullable `exemplar_id` Int32 column, aligned row-for-row with
    /// the input. Nulls appear only when sampling discarded rows.
    pub members: RecordBatch,
}

impl Aggregated {
    /// Number of retained exemplars.
    pub fn n_exemplars(&self) -> usize {
        self.exemplars.num_rows()
    }
}

/// The aggregation engine, generic over distance precision (`f32` or `f64`).
///
/// Both precisions converge to roughly the same exemplar count and member
/// distribution; `f32` halves the memory the clustering pass touches.
pub struct Aggregator<T: Real = f64> {
    config: AggregatorConfig,
    progress: Option<ProgressFn>,
    cancel: Option<Arc<AtomicBool>>,
    _precision: PhantomData<T>,
}

impl<T: Real> Aggregator<T> {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            progress: None,
            cancel: None,
            _precision: PhantomData,
        }
    }

    /// Install a progress callback. The general path reports roughly one
    /// hundred steps over the row loop; every path reports start and end.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Install a cooperative cancel flag. Raising it makes workers exit at
    /// their next row and the call return [`AggregateError::Interrupted`].
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Aggregate `batch` into exemplars and members.
    ///
    /// No partial results on error: the first failure aborts the call after
    /// reporting `Error` (or `Interrupt`) through the progress callback.
    pub fn aggregate(&self, batch: &RecordBatch) -> Result<Aggregated, AggregateError> {
        self.emit(0.0, ProgressStatus::Running);
        match self.run(batch) {
            Ok(out) => {
                self.emit(1.0, ProgressStatus::Done);
                Ok(out)
            }
            Err(e) => {
                let status = if matches!(e, AggregateError::Interrupted) {
                    ProgressStatus::Interrupt
                } else {
                    ProgressStatus::Error
                };
                self.emit(1.0, status);
                Err(e)
            }
        }
    }

    fn emit(&self, fraction: f32, status: ProgressStatus) {
        if let Some(p) = &self.progress {
            p(fraction, status);
        }
    }

    fn run(&self, batch: &RecordBatch) -> Result<Aggregated, AggregateError> {
        let nrows = batch.num_rows();
        let mut members = vec![0i32; nrows];
        let seed = resolve_seed(self.config.seed);
        let mut was_sampled = false;

        if nrows >= self.config.min_rows {
            // Wrap every numeric column; keep categoricals only for narrow
            // tables. Wider tables drop them entirely, so an all-categorical
            // wide table falls through to the 0-D path (known limitation).
            let keep_categoricals = batch.num_columns() < 3;
            let mut contcols: Vec<NumericColumn<T>> = Vec::with_capacity(batch.num_columns());
            let mut catcols: Vec<ArrayRef> = Vec::new();
            for col in batch.columns() {
                if let Some(nc) = NumericColumn::from_array(col) {
                    contcols.push(nc);
                } else if keep_categoricals {
                    catcols.push(col.clone());
                }
            }

            let ncols = contcols.len() + catcols.len();
            info!(
                nrows,
                numeric = contcols.len(),
                categorical = catcols.len(),
                "dispatching aggregation"
            );

            let (max_bins, n_na_bins) = match ncols {
                0 => {
                    self.group_0d(batch, &mut members)?;
                    (self.config.nd_max_bins, 0)
                }
                1 => {
                    self.group_1d(&contcols, &catcols, &mut members)?;
                    (self.config.n_bins, 1)
                }
                2 => {
                    self.group_2d(&contcols, &catcols, &mut members)?;
                    (self.config.nx_bins * self.config.ny_bins, 3)
                }
                _ => {
                    let params = NdParams {
                        nd_max_bins: self.config.nd_max_bins,
                        max_dimensions: self.config.max_dimensions,
                        seed,
                        nthreads: resolve_nthreads(self.config.nthreads),
                    };
                    let result = cluster::cluster_nd(
                        &contcols,
                        &params,
                        &mut members,
                        self.progress.as_ref(),
                        self.cancel.as_deref(),
                    )?;
                    info!(
                        exemplars = result.exemplars.len(),
                        "general clustering pass finished"
                    );
                    (self.config.nd_max_bins, 0)
                }
            };

            was_sampled = sample_exemplars(&mut members, max_bins, n_na_bins, seed);
            if was_sampled {
                info!(max_bins, "too many groups, sampled a uniform subset");
            }
        } else {
            self.group_0d(batch, &mut members)?;
        }

        finalize(batch, &mut members, was_sampled)
    }

    // ------------------------------------------------------------------
    // Grouping paths
    // ------------------------------------------------------------------

    /// No grouping: every row is its own exemplar, ranked by a sort over the
    /// first column with missing values last.
    fn group_0d(&self, batch: &RecordBatch, members: &mut [i32]) -> Result<(), AggregateError> {
        if batch.num_columns() == 0 {
            for (i, m) in members.iter_mut().enumerate() {
                *m = i as i32;
            }
            return Ok(());
        }
        let indices = sort_to_indices(
            batch.column(0),
            Some(SortOptions {
                descending: false,
                nulls_first: false,
            }),
            None,
        )?;
        for (rank, row) in indices.values().iter().enumerate() {
            members[*row as usize] = rank as i32;
        }
        Ok(())
    }

    fn group_1d(
        &self,
        contcols: &[NumericColumn<T>],
        catcols: &[ArrayRef],
        members: &mut [i32],
    ) -> Result<(), AggregateError> {
        match contcols.first() {
            Some(col) => {
                self.group_1d_continuous(col, members);
                Ok(())
            }
            None => self.group_1d_categorical(&catcols[0], members),
        }
    }

    fn group_1d_continuous(&self, col: &NumericColumn<T>, members: &mut [i32]) {
        let nc = NormCoeffs::new(col.min(), col.max(), self.config.n_bins);
        for (i, m) in members.iter_mut().enumerate() {
            let v = col.value(i);
            *m = if v.is_nan() { NA } else { nc.apply(v).trunc_i32() };
        }
    }

    fn group_1d_categorical(
        &self,
        col: &ArrayRef,
        members: &mut [i32],
    ) -> Result<(), AggregateError> {
        let groups = RowGroups::from_columns(std::slice::from_ref(col))?;
        for g in 0..groups.ngroups() {
            for &row in groups.group(g) {
                members[row as usize] = g as i32;
            }
        }
        Ok(())
    }

    /// Two-column grouping. Rows with missing values are segregated into the
    /// negative bins: (value, NA) → −1, (NA, value) → −2, (NA, NA) → −3, so
    /// missing and non-missing members are never mixed; finalization
    /// renumbers the surviving bins from zero, missing classes first.
    fn group_2d(
        &self,
        contcols: &[NumericColumn<T>],
        catcols: &[ArrayRef],
        members: &mut [i32],
    ) -> Result<(), AggregateError> {
        match contcols.len() {
            0 => self.group_2d_categorical(catcols, members),
            1 => self.group_2d_mixed(&contcols[0], &catcols[0], members),
            2 => {
                self.group_2d_continuous(contcols, members);
                Ok(())
            }
            n => Err(AggregateError::Schema(format!(
                "too many numeric columns for 2-d aggregation: {n}"
            ))),
        }
    }

    fn group_2d_continuous(&self, contcols: &[NumericColumn<T>], members: &mut [i32]) {
        let ncx = NormCoeffs::new(contcols[0].min(), contcols[0].max(), self.config.nx_bins);
        let ncy = NormCoeffs::new(contcols[1].min(), contcols[1].max(), self.config.ny_bins);
        let nx = self.config.nx_bins as i32;
        for (i, m) in members.iter_mut().enumerate() {
            let v0 = contcols[0].value(i);
            let v1 = contcols[1].value(i);
            let na_case = v1.is_nan() as i32 + 2 * v0.is_nan() as i32;
            *m = if na_case != 0 {
                -na_case
            } else {
                ncy.apply(v1).trunc_i32() * nx + ncx.apply(v0).trunc_i32()
            };
        }
    }

    fn group_2d_mixed(
        &self,
        cont: &NumericColumn<T>,
        cat: &ArrayRef,
        members: &mut [i32],
    ) -> Result<(), AggregateError> {
        require_string(cat, "2-d mixed aggregation")?;
        let groups = RowGroups::from_columns(std::slice::from_ref(cat))?;
        let nc = NormCoeffs::new(cont.min(), cont.max(), self.config.nx_bins);
        for g in 0..groups.ngroups() {
            let base = (g * self.config.nx_bins) as i32;
            for &row in groups.group(g) {
                let r = row as usize;
                let v = cont.value(r);
                let na_case = cat.is_null(r) as i32 + 2 * v.is_nan() as i32;
                members[r] = if na_case != 0 {
                    -na_case
                } else {
                    base + nc.apply(v).trunc_i32()
                };
            }
        }
        Ok(())
    }

    fn group_2d_categorical(
        &self,
        catcols: &[ArrayRef],
        members: &mut [i32],
    ) -> Result<(), AggregateError> {
        require_string(&catcols[0], "2-d categorical aggregation")?;
        require_string(&catcols[1], "2-d categorical aggregation")?;
        let groups = RowGroups::from_columns(&catcols[..2])?;
        for g in 0..groups.ngroups() {
            for &row in groups.group(g) {
                let r = row as usize;
                let na_case = catcols[1].is_null(r) as i32 + 2 * catcols[0].is_null(r) as i32;
                members[r] = if na_case != 0 { -na_case } else { g as i32 };
            }
        }
        Ok(())
    }
}

fn require_string(col: &ArrayRef, context: &str) -> Result<(), AggregateError> {
    match col.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 => Ok(()),
        other => Err(AggregateError::Schema(format!(
            "{context} requires string columns, got {other}"
        ))),
    }
}

fn resolve_seed(seed: u32) -> u64 {
    if seed != 0 {
        seed as u64
    } else {
        rand::rng().random::<u32>() as u64
    }
}

fn resolve_nthreads(nthreads: usize) -> usize {
    if nthreads > 0 {
        nthreads
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

// ============================================================================
// Sampling
// ============================================================================

/// When grouping produced more than `max_bins + n_na_bins` groups, keep a
/// uniform random subset of `max_bins` groups and discard the rest.
///
/// `n_na_bins` reserves headroom for the missing-value bins a path may have
/// produced (0, 1, or 3). Selected groups are renumbered 0, 1, … in
/// selection order; rows of unselected groups drop to the NA sentinel and
/// are skipped by finalization.
fn sample_exemplars(members: &mut [i32], max_bins: usize, n_na_bins: usize, seed: u64) -> bool {
    let groups = RowGroups::from_members(members);
    let ngroups = groups.ngroups();
    if ngroups <= max_bins + n_na_bins {
        return false;
    }

    for m in members.iter_mut() {
        *m = NA;
    }

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut k: i32 = 0;
    while (k as usize) < max_bins {
        let g = rng.random_range(0..ngroups);
        let rows = groups.group(g);
        if members[rows[0] as usize] == NA {
            for &row in rows {
                members[row as usize] = k;
            }
            k += 1;
        }
    }
    true
}

// ============================================================================
// Finalization
// ============================================================================

/// Renumber groups to compact exemplar ids and materialize the two output
/// tables. The first row of each group becomes its exemplar; after sampling,
/// the leading NA group is skipped and its rows keep a missing exemplar id.
///
/// Idempotent: on an already-finalized members vector every group key equals
/// its compact id, so a second pass rewrites nothing.
fn finalize(
    batch: &RecordBatch,
    members: &mut [i32],
    was_sampled: bool,
) -> Result<Aggregated, AggregateError> {
    let groups = RowGroups::from_members(members);
    let skip = usize::from(was_sampled);
    let ngroups = groups.ngroups();
    let n_exemplars = ngroups - skip;

    let mut exemplar_indices: Vec<u32> = Vec::with_capacity(n_exemplars);
    let mut counts: Vec<i32> = Vec::with_capacity(n_exemplars);
    let mut remap: HashMap<i32, i32> = HashMap::with_capacity(n_exemplars);
    for g in skip..ngroups {
        let rows = groups.group(g);
        exemplar_indices.push(rows[0]);
        counts.push(rows.len() as i32);
        remap.insert(members[rows[0] as usize], (g - skip) as i32);
    }

    members.par_iter_mut().for_each(|m| {
        if was_sampled && *m == NA {
            return;
        }
        if let Some(&new) = remap.get(m) {
            *m = new;
        }
    });

    let member_array: Int32Array = members
        .iter()
        .map(|&m| if m == NA { None } else { Some(m) })
        .collect();
    let members_schema = Schema::new(vec![Field::new("exemplar_id", DataType::Int32, true)]);
    let members_batch = RecordBatch::try_new(
        Arc::new(members_schema),
        vec![Arc::new(member_array) as ArrayRef],
    )?;

    let idx = UInt32Array::from(exemplar_indices);
    let mut columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &idx, None))
        .collect::<Result<_, _>>()?;
    columns.push(Arc::new(Int32Array::from(counts)) as ArrayRef);

    let mut fields: Vec<FieldRef> = batch.schema().fields().iter().cloned().collect();
    fields.push(Arc::new(Field::new(
        "members_count",
        DataType::Int32,
        false,
    )));
    let exemplars_batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;

    Ok(Aggregated {
        exemplars: exemplars_batch,
        members: members_batch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, StringArray};

    fn batch_of(columns: Vec<(&str, ArrayRef)>) -> RecordBatch {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, col)| Field::new(*name, col.data_type().clone(), true))
            .collect();
        let arrays: Vec<ArrayRef> = columns.into_iter().map(|(_, col)| col).collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).expect("valid batch")
    }

    fn member_ids(out: &Aggregated) -> Vec<Option<i32>> {
        let col = out
            .members
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("int32 members");
        (0..col.len())
            .map(|i| (!col.is_null(i)).then(|| col.value(i)))
            .collect()
    }

    fn counts(out: &Aggregated) -> Vec<i32> {
        let col = out
            .exemplars
            .column(out.exemplars.num_columns() - 1)
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("int32 counts");
        col.values().to_vec()
    }

    fn small_config() -> AggregatorConfig {
        AggregatorConfig {
            min_rows: 1,
            seed: 42,
            ..AggregatorConfig::default()
        }
    }

    #[test]
    fn constant_column_collapses_to_one_exemplar() {
        let col: ArrayRef = Arc::new(Float64Array::from(vec![7.0; 100]));
        let batch = batch_of(vec![("x", col)]);
        let config = AggregatorConfig {
            n_bins: 10,
            ..small_config()
        };
        let out = Aggregator::<f64>::new(config)
            .aggregate(&batch)
            .expect("aggregate");

        assert_eq!(out.n_exemplars(), 1);
        assert_eq!(counts(&out), vec![100]);
        assert!(member_ids(&out).iter().all(|m| *m == Some(0)));
        let x = out
            .exemplars
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .expect("float column");
        assert_eq!(x.value(0), 7.0);
    }

    #[test]
    fn one_dimensional_binning_pattern() {
        let col: ArrayRef = Arc::new(Float64Array::from(
            (0..10).map(|i| i as f64).collect::<Vec<_>>(),
        ));
        let batch = batch_of(vec![("x", col)]);
        let config = AggregatorConfig {
            n_bins: 5,
            ..small_config()
        };
        let out = Aggregator::<f64>::new(config)
            .aggregate(&batch)
            .expect("aggregate");

        assert_eq!(out.n_exemplars(), 5);
        assert_eq!(counts(&out), vec![2; 5]);
        let ids: Vec<i32> = member_ids(&out).into_iter().flatten().collect();
        assert_eq!(ids, vec![0, 0, 1, 1, 2, 2, 3, 3, 4, 4]);
    }

    #[test]
    fn two_dimensional_missing_classes_stay_segregated() {
        let x: ArrayRef = Arc::new(Float64Array::from(vec![
            Some(1.0),
            None,
            Some(3.0),
            None,
        ]));
        let y: ArrayRef = Arc::new(Float64Array::from(vec![
            Some(1.0),
            Some(2.0),
            None,
            None,
        ]));
        let batch = batch_of(vec![("x", x), ("y", y)]);
        let config = AggregatorConfig {
            nx_bins: 2,
            ny_bins: 2,
            ..small_config()
        };
        let out = Aggregator::<f64>::new(config)
            .aggregate(&batch)
            .expect("aggregate");

        assert_eq!(out.n_exemplars(), 4);
        assert_eq!(counts(&out), vec![1; 4]);
        // All four rows fall into distinct groups.
        let ids: Vec<i32> = member_ids(&out).into_iter().flatten().collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn below_min_rows_every_row_is_an_exemplar() {
        let col: ArrayRef = Arc::new(Float64Array::from(vec![3.0, 1.0, 2.0]));
        let batch = batch_of(vec![("x", col)]);
        let config = AggregatorConfig {
            min_rows: 10,
            ..AggregatorConfig::default()
        };
        let out = Aggregator::<f64>::new(config)
            .aggregate(&batch)
            .expect("aggregate");

        assert_eq!(out.n_exemplars(), 3);
        assert_eq!(counts(&out), vec![1, 1, 1]);
        // Ranks follow the sort of the first column: 3.0→2, 1.0→0, 2.0→1.
        let ids: Vec<i32> = member_ids(&out).into_iter().flatten().collect();
        assert_eq!(ids, vec![2, 0, 1]);
    }

    #[test]
    fn one_dimensional_categorical_groups_by_value() {
        let col: ArrayRef = Arc::new(StringArray::from(vec![
            Some("red"),
            Some("blue"),
            Some("red"),
            None,
        ]));
        let batch = batch_of(vec![("color", col)]);
        let out = Aggregator::<f64>::new(small_config())
            .aggregate(&batch)
            .expect("aggregate");

        assert_eq!(out.n_exemplars(), 3);
        let ids: Vec<i32> = member_ids(&out).into_iter().flatten().collect();
        assert_eq!(ids[0], ids[2], "equal strings share an exemplar");
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[3], "missing stays segregated");
    }

    #[test]
    fn two_dimensional_mixed_groups_by_string_then_bins() {
        let x: ArrayRef = Arc::new(Float64Array::from(vec![0.0, 9.0, 0.5, 9.0]));
        let c: ArrayRef = Arc::new(StringArray::from(vec!["a", "a", "b", "b"]));
        let batch = batch_of(vec![("x", x), ("c", c)]);
        let config = AggregatorConfig {
            nx_bins: 2,
            ..small_config()
        };
        let out = Aggregator::<f64>::new(config)
            .aggregate(&batch)
            .expect("aggregate");

        // Four distinct (group, bin) combinations.
        assert_eq!(out.n_exemplars(), 4);
    }

    #[test]
    fn two_dimensional_categorical_requires_strings() {
        let x: ArrayRef = Arc::new(StringArray::from(vec!["a", "b"]));
        let d: ArrayRef = Arc::new(arrow::array::Date32Array::from(vec![1, 2]));
        let batch = batch_of(vec![("x", x), ("d", d)]);
        let err = Aggregator::<f64>::new(small_config())
            .aggregate(&batch)
            .expect_err("non-string categorical must fail");
        assert!(matches!(err, AggregateError::Schema(_)));
    }

    #[test]
    fn sampling_caps_group_count() {
        // One categorical column with 200 distinct values; shrink n_bins to
        // force sampling.
        let values: Vec<String> = (0..200).map(|i| format!("g{i}")).collect();
        let col: ArrayRef = Arc::new(StringArray::from(
            values.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        ));
        let batch = batch_of(vec![("c", col)]);
        let config = AggregatorConfig {
            n_bins: 10,
            ..small_config()
        };
        let out = Aggregator::<f64>::new(config)
            .aggregate(&batch)
            .expect("aggregate");

        assert_eq!(out.n_exemplars(), 10);
        let ids = member_ids(&out);
        let kept = ids.iter().filter(|m| m.is_some()).count();
        assert_eq!(kept, 10, "each selected group has exactly one row");
        assert_eq!(counts(&out).iter().sum::<i32>(), 10);
    }

    #[test]
    fn wide_all_categorical_table_degrades_to_0d() {
        // Three string columns: categoricals are dropped, leaving zero kept
        // columns, so every row groups by itself and sampling caps the count.
        let n = 30;
        let make = |prefix: &str| -> ArrayRef {
            Arc::new(StringArray::from(
                (0..n).map(|i| format!("{prefix}{i}")).collect::<Vec<_>>(),
            ))
        };
        let batch = batch_of(vec![("a", make("a")), ("b", make("b")), ("c", make("c"))]);
        let config = AggregatorConfig {
            nd_max_bins: 8,
            ..small_config()
        };
        let out = Aggregator::<f64>::new(config)
            .aggregate(&batch)
            .expect("aggregate");
        assert_eq!(out.n_exemplars(), 8);
    }

    #[test]
    fn finalization_is_idempotent() {
        let col: ArrayRef = Arc::new(Float64Array::from(
            (0..10).map(|i| i as f64).collect::<Vec<_>>(),
        ));
        let batch = batch_of(vec![("x", col)]);
        let mut members = vec![4, 4, 9, 9, 9, 0, 0, 0, 0, 7];
        let first = finalize(&batch, &mut members, false).expect("finalize");
        let after_first = members.clone();
        let second = finalize(&batch, &mut members, false).expect("finalize again");
        assert_eq!(members, after_first);
        assert_eq!(
            counts(&Aggregated {
                exemplars: first.exemplars,
                members: first.members
            }),
            counts(&Aggregated {
                exemplars: second.exemplars,
                members: second.members
            })
        );
    }

    #[test]
    fn progress_reports_start_and_done() {
        use std::sync::Mutex;
        let seen: Arc<Mutex<Vec<(f32, ProgressStatus)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let col: ArrayRef = Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0]));
        let batch = batch_of(vec![("x", col)]);
        Aggregator::<f64>::new(small_config())
            .with_progress(Arc::new(move |f, s| sink.lock().unwrap().push((f, s))))
            .aggregate(&batch)
            .expect("aggregate");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&(0.0, ProgressStatus::Running)));
        assert_eq!(seen.last(), Some(&(1.0, ProgressStatus::Done)));
    }
}
