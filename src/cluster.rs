//! N-dimensional online exemplar discovery.
//!
//! The general path treats every numeric column as one coordinate (after an
//! affine squeeze into `[0, 1)`, or a seeded Gaussian projection when there
//! are more columns than `max_dimensions`), then makes a single concurrent
//! pass over the rows. A row either lands inside the radius of an existing
//! exemplar or founds a new one; whenever the exemplar table outgrows its
//! cap, the radius is widened and close exemplars are merged in place.
//!
//! Workers probe the shared exemplar table under a read lock and only take
//! the write lock to insert. A generation counter detects insertions that
//! raced with the lock upgrade, in which case the probe is rerun against the
//! fresh table.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::RwLock;
use rand::prelude::*;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use tracing::debug;

use crate::column::{NumericColumn, Real};
use crate::engine::{AggregateError, ProgressFn, ProgressStatus};

/// Number of progress callback steps emitted across the row loop.
const PROGRESS_STEPS: usize = 100;

// ============================================================================
// Normalization
// ============================================================================

/// Affine coefficients mapping a column into `[0, bins)`.
///
/// `factor = bins·(1−ε)/(max−min)`, `shift = −factor·min`. A constant column
/// (`|max−min| ≤ ε`) degenerates to `factor = 0, shift = bins/2`, pinning
/// every non-missing value at the midpoint. Missing values propagate as NaN
/// through [`apply`](Self::apply).
#[derive(Debug, Clone, Copy)]
pub struct NormCoeffs<T> {
    pub factor: T,
    pub shift: T,
}

impl<T: Real> NormCoeffs<T> {
    pub fn new(min: T, max: T, bins: usize) -> Self {
        let eps = T::epsilon();
        if (max - min).abs() > eps {
            let factor = T::from_usize(bins) * (T::one() - eps) / (max - min);
            Self {
                factor,
                shift: -factor * min,
            }
        } else {
            Self {
                factor: T::zero(),
                shift: T::from_f64(0.5) * T::from_usize(bins),
            }
        }
    }

    #[inline]
    pub fn apply(&self, x: T) -> T {
        x * self.factor + self.shift
    }
}

/// Write the normalized coordinates of `row` into `out` (one per column).
fn normalize_row<T: Real>(
    columns: &[NumericColumn<T>],
    coeffs: &[NormCoeffs<T>],
    row: usize,
    out: &mut [T],
) {
    for (i, (col, nc)) in columns.iter().zip(coeffs).enumerate() {
        out[i] = nc.apply(col.value(row));
    }
}

/// Project the normalized `row` onto the subspace spanned by `pmatrix`
/// (row-major `ncols × ndims`), averaging over the non-missing components.
///
/// A wholly-missing row divides zero by zero and comes out NaN in every
/// coordinate; the distance kernel then reports it infinitely far from
/// everything, so such rows always found their own exemplar.
fn project_row<T: Real>(
    columns: &[NumericColumn<T>],
    coeffs: &[NormCoeffs<T>],
    row: usize,
    pmatrix: &[T],
    out: &mut [T],
) {
    let ndims = out.len();
    for v in out.iter_mut() {
        *v = T::zero();
    }
    let mut n = 0usize;
    for (i, (col, nc)) in columns.iter().zip(coeffs).enumerate() {
        let value = col.value(row);
        if value.is_nan() {
            continue;
        }
        let x = nc.apply(value);
        for (j, v) in out.iter_mut().enumerate() {
            *v = *v + pmatrix[i * ndims + j] * x;
        }
        n += 1;
    }
    let n_t = T::from_usize(n);
    for v in out.iter_mut() {
        *v = *v / n_t;
    }
}

/// Sample the `ncols × ndims` Gaussian projection matrix from the run seed.
fn generate_pmatrix<T: Real>(ncols: usize, ndims: usize, seed: u64) -> Vec<T> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..ncols * ndims)
        .map(|_| T::standard_normal(&mut rng))
        .collect()
}

// ============================================================================
// Distance kernel
// ============================================================================

/// Squared Euclidean distance with missing-value skip.
///
/// Coordinates where either side is NaN are skipped; the partial sum is
/// scaled by `ndims / n` so that rows with many missings are not artificially
/// close. With `early_exit` the scan aborts (returning the unscaled partial
/// sum) as soon as it exceeds `delta` — callers only compare against `delta`,
/// so the exact overshoot value never matters. When no coordinate pair
/// participates the distance is +∞, never NaN.
pub fn distance<T: Real>(e1: &[T], e2: &[T], delta: T, early_exit: bool) -> T {
    let ndims = e1.len();
    let mut sum = T::zero();
    let mut n = 0usize;
    for i in 0..ndims {
        if e1[i].is_nan() || e2[i].is_nan() {
            continue;
        }
        n += 1;
        let diff = e1[i] - e2[i];
        sum = sum + diff * diff;
        if early_exit && sum > delta {
            return sum;
        }
    }
    if n == 0 {
        return T::infinity();
    }
    sum * T::from_usize(ndims) / T::from_usize(n)
}

// ============================================================================
// Coprime strides
// ============================================================================

/// Rebuild the list `{k ∈ [1, n) : gcd(k, n) = 1}` used as probe strides.
/// For `n ≤ 1` the list is `{1}` (the single exemplar is always visited).
fn coprimes_into(n: usize, out: &mut Vec<usize>) {
    out.clear();
    if n <= 1 {
        out.push(1);
        return;
    }
    for k in 1..n {
        if gcd(k, n) == 1 {
            out.push(k);
        }
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

// ============================================================================
// Shared clustering state
// ============================================================================

/// One exemplar: its creation-order id and the coordinates of the row that
/// founded it. Ids are stable; merging only redirects ids, never reuses them.
#[derive(Debug)]
pub struct Exemplar<T> {
    pub id: usize,
    pub coords: Vec<T>,
}

struct NdState<T> {
    exemplars: Vec<Exemplar<T>>,
    /// Merge forest over creation-order ids: `ids[j] = i` means exemplar `j`
    /// was merged into `i`. Higher ids only ever point at lower ones.
    ids: Vec<usize>,
    coprimes: Vec<usize>,
    /// Current squared capture radius.
    delta: T,
    /// Generation counter bumped on every insertion; lets a worker detect
    /// that the table changed between its probe and its write lock.
    ecounter: usize,
}

/// Parameters the engine resolves before entering the general path.
pub(crate) struct NdParams {
    pub nd_max_bins: usize,
    pub max_dimensions: usize,
    pub seed: u64,
    pub nthreads: usize,
}

/// Outcome of the clustering pass, after merge compaction.
#[derive(Debug)]
pub(crate) struct NdResult<T> {
    /// Final squared capture radius.
    pub delta: T,
    /// Surviving exemplars; member codes refer to their `id`s.
    pub exemplars: Vec<Exemplar<T>>,
}

// ============================================================================
// Clustering pass
// ============================================================================

/// Run the concurrent single-pass clustering over all rows, writing each
/// row's exemplar id into `members`.
pub(crate) fn cluster_nd<T: Real>(
    columns: &[NumericColumn<T>],
    params: &NdParams,
    members: &mut [i32],
    progress: Option<&ProgressFn>,
    cancel: Option<&AtomicBool>,
) -> Result<NdResult<T>, AggregateError> {
    let nrows = members.len();
    let ncols = columns.len();
    let ndims = params.max_dimensions.min(ncols);
    let do_projection = ncols > params.max_dimensions;
    let pmatrix = do_projection.then(|| generate_pmatrix::<T>(ncols, ndims, params.seed));
    let coeffs: Vec<NormCoeffs<T>> = columns
        .iter()
        .map(|c| NormCoeffs::new(c.min(), c.max(), 1))
        .collect();

    let nth = params.nthreads.min(nrows).max(1);
    debug!(nrows, ncols, ndims, nth, projected = do_projection, "starting n-d clustering");

    let state = RwLock::new(NdState {
        exemplars: Vec::new(),
        ids: Vec::new(),
        coprimes: Vec::new(),
        delta: T::epsilon(),
        ecounter: 0,
    });
    let shared: Vec<AtomicI32> = members.iter().map(|&m| AtomicI32::new(m)).collect();

    let run: Result<(), AggregateError> = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(nth);
        for ith in 0..nth {
            let state = &state;
            let shared = &shared[..];
            let coeffs = &coeffs[..];
            let pmatrix = pmatrix.as_deref();
            handles.push(scope.spawn(move || {
                nd_worker(
                    ith, nth, columns, coeffs, pmatrix, ndims, params, state, shared, progress,
                    cancel,
                )
            }));
        }
        let mut first_err = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(AggregateError::WorkerPanic);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    });
    run?;

    for (m, a) in members.iter_mut().zip(shared.iter()) {
        *m = a.load(Ordering::Relaxed);
    }

    let state = state.into_inner();
    adjust_members(&state.ids, members);
    debug!(
        exemplars = state.exemplars.len(),
        delta = %state.delta,
        "n-d clustering finished"
    );
    Ok(NdResult {
        delta: state.delta,
        exemplars: state.exemplars,
    })
}

#[allow(clippy::too_many_arguments)]
fn nd_worker<T: Real>(
    ith: usize,
    nth: usize,
    columns: &[NumericColumn<T>],
    coeffs: &[NormCoeffs<T>],
    pmatrix: Option<&[T]>,
    ndims: usize,
    params: &NdParams,
    state: &RwLock<NdState<T>>,
    members: &[AtomicI32],
    progress: Option<&ProgressFn>,
    cancel: Option<&AtomicBool>,
) -> Result<(), AggregateError> {
    let nrows = members.len();
    let mut rng = SmallRng::seed_from_u64(params.seed.wrapping_add(ith as u64));
    let rstep = if nrows > nth * PROGRESS_STEPS {
        nrows / (nth * PROGRESS_STEPS)
    } else {
        1
    };
    let mut coords = vec![T::zero(); ndims];

    let mut i = ith;
    while i < nrows {
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Err(AggregateError::Interrupted);
        }

        match pmatrix {
            Some(p) => project_row(columns, coeffs, i, p, &mut coords),
            None => normalize_row(columns, coeffs, i, &mut coords),
        }

        'probe: loop {
            // Probe phase: scan the exemplar table under the read lock,
            // visiting entries along a modular quasi-random cycle so that
            // ties spread uniformly across clusters instead of always
            // favoring the oldest exemplar.
            let ecounter_local = {
                let st = state.read();
                let snapshot = st.ecounter;
                let nex = st.exemplars.len();
                let e0 = if nex > 0 { rng.random_range(0..nex) } else { 0 };
                let c0 = if st.coprimes.is_empty() {
                    0
                } else {
                    rng.random_range(0..st.coprimes.len())
                };
                let mut captured = None;
                for k in 0..nex {
                    let j = (k * st.coprimes[c0] + e0) % nex;
                    let d = distance(&coords, &st.exemplars[j].coords, st.delta, true);
                    if d < st.delta {
                        captured = Some(st.exemplars[j].id as i32);
                        break;
                    }
                }
                if let Some(id) = captured {
                    members[i].store(id, Ordering::Relaxed);
                    break 'probe;
                }
                snapshot
            };

            // No exemplar captured the row: upgrade to the write lock and
            // re-check the generation counter. If another worker extended
            // the table in between, rescan against the fresh table instead
            // of inserting a near-duplicate.
            let mut st = state.write();
            if st.ecounter == ecounter_local {
                st.ecounter += 1;
                let id = st.ids.len();
                st.ids.push(id);
                members[i].store(id as i32, Ordering::Relaxed);
                st.exemplars.push(Exemplar {
                    id,
                    coords: coords.clone(),
                });
                if st.exemplars.len() > params.nd_max_bins {
                    adjust_delta(&mut st);
                }
                let n = st.exemplars.len();
                coprimes_into(n, &mut st.coprimes);
                break 'probe;
            }
        }

        if ith == 0
            && (i / nth) % rstep == 0
            && let Some(p) = progress
        {
            p((i + 1) as f32 / nrows as f32, ProgressStatus::Running);
        }
        i += nth;
    }
    Ok(())
}

/// Widen the capture radius and merge exemplars that ended up too close.
///
/// Over the full upper-triangular pairwise distance matrix, let μ be the
/// mean Euclidean distance; `delta_merge = (μ/2)²`. Pairs closer than
/// `delta_merge` are union-merged (the higher id redirected to the lower).
/// The new radius is `(√delta + √delta_merge)²`: members of a merged
/// exemplar sat within the old radius of it, and it sits within the merge
/// radius of its target, so everything stays covered.
fn adjust_delta<T: Real>(st: &mut NdState<T>) {
    let n = st.exemplars.len();
    if n < 2 {
        return;
    }
    let n_distances = (n * n - n) / 2;
    let mut pair_dist = Vec::with_capacity(n_distances);
    let mut total = T::zero();
    for i in 0..n - 1 {
        for j in i + 1..n {
            let d = distance(
                &st.exemplars[i].coords,
                &st.exemplars[j].coords,
                st.delta,
                false,
            );
            total = total + d.sqrt();
            pair_dist.push(d);
        }
    }

    let mean = total / T::from_usize(n_distances);
    let delta_merge = (T::from_f64(0.5) * mean).powi(2);
    st.delta = st.delta + delta_merge + T::from_f64(2.0) * (st.delta * delta_merge).sqrt();

    let mut alive = vec![true; n];
    let mut k = 0;
    for i in 0..n - 1 {
        for j in i + 1..n {
            if pair_dist[k] < delta_merge && alive[i] && alive[j] {
                st.ids[st.exemplars[j].id] = st.exemplars[i].id;
                alive[j] = false;
            }
            k += 1;
        }
    }

    let mut keep = alive.iter();
    st.exemplars.retain(|_| *keep.next().unwrap_or(&true));
    debug!(
        survivors = st.exemplars.len(),
        merged = n - st.exemplars.len(),
        delta = %st.delta,
        "widened radius and merged exemplars"
    );
}

/// Compress merge chains and rewrite every member code to its root id.
fn adjust_members(ids: &[usize], members: &mut [i32]) {
    let map: Vec<usize> = (0..ids.len())
        .into_par_iter()
        .map(|i| {
            let mut k = i;
            while ids[k] != k {
                k = ids[k];
            }
            k
        })
        .collect();
    members.par_iter_mut().for_each(|m| {
        *m = map[*m as usize] as i32;
    });
}
