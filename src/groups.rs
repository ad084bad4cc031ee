//! Row grouping primitives.
//!
//! Both the categorical paths and finalization need the same shape of result:
//! a permutation of row indices with every group contiguous, plus the group
//! start offsets. [`RowGroups`] is that shape, built either from the working
//! members vector (argsort over `i32` codes) or from one or two Arrow
//! columns (lexicographic sort, then partition on value changes).

use arrow::array::ArrayRef;
use arrow::compute::{SortColumn, SortOptions, lexsort_to_indices, partition, take};
use arrow::error::ArrowError;

/// Contiguous grouping of row indices.
///
/// `row_order` maps sorted positions back to original rows; rows of group `g`
/// are `row_order[offsets[g]..offsets[g + 1]]`. Groups are ordered by their
/// sort key, so for the members vector the NA sentinel (`i32::MIN`) always
/// lands in group 0 when present.
pub struct RowGroups {
    row_order: Vec<u32>,
    offsets: Vec<u32>,
}

impl RowGroups {
    /// Group rows by their `i32` code in the working members vector.
    pub fn from_members(members: &[i32]) -> Self {
        let mut row_order: Vec<u32> = (0..members.len() as u32).collect();
        row_order.sort_unstable_by_key(|&i| members[i as usize]);

        let mut offsets = Vec::with_capacity(16);
        offsets.push(0);
        for pos in 1..row_order.len() {
            if members[row_order[pos] as usize] != members[row_order[pos - 1] as usize] {
                offsets.push(pos as u32);
            }
        }
        offsets.push(row_order.len() as u32);
        // An empty input still carries the closing offset, nothing else.
        if row_order.is_empty() {
            offsets.truncate(1);
        }
        Self { row_order, offsets }
    }

    /// Group rows by the joint value of one or more columns.
    ///
    /// Missing values sort first and form their own group per distinct
    /// missing pattern. Group numbering follows sort order; callers renumber
    /// at finalization, so only contiguity matters here.
    pub fn from_columns(columns: &[ArrayRef]) -> Result<Self, ArrowError> {
        let sort_columns: Vec<SortColumn> = columns
            .iter()
            .map(|c| SortColumn {
                values: c.clone(),
                options: Some(SortOptions {
                    descending: false,
                    nulls_first: true,
                }),
            })
            .collect();
        let indices = lexsort_to_indices(&sort_columns, None)?;

        let sorted: Vec<ArrayRef> = columns
            .iter()
            .map(|c| take(c.as_ref(), &indices, None))
            .collect::<Result<_, _>>()?;
        let ranges = partition(&sorted)?.ranges();

        let mut offsets = Vec::with_capacity(ranges.len() + 1);
        offsets.push(0);
        for r in &ranges {
            offsets.push(r.end as u32);
        }

        Ok(Self {
            row_order: indices.values().to_vec(),
            offsets,
        })
    }

    /// Number of groups.
    pub fn ngroups(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Original row indices belonging to group `g`.
    pub fn group(&self, g: usize) -> &[u32] {
        let start = self.offsets[g] as usize;
        let end = self.offsets[g + 1] as usize;
        &self.row_order[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, StringArray};
    use std::sync::Arc;

    #[test]
    fn members_grouping_sorts_na_sentinel_first() {
        let members = vec![2, i32::MIN, 0, 2, 0];
        let groups = RowGroups::from_members(&members);
        assert_eq!(groups.ngroups(), 3);
        assert_eq!(groups.group(0), &[1]);
        let mut g1 = groups.group(1).to_vec();
        g1.sort();
        assert_eq!(g1, vec![2, 4]);
        let mut g2 = groups.group(2).to_vec();
        g2.sort();
        assert_eq!(g2, vec![0, 3]);
    }

    #[test]
    fn empty_members_yield_no_groups() {
        let groups = RowGroups::from_members(&[]);
        assert_eq!(groups.ngroups(), 0);
    }

    #[test]
    fn single_column_groupby_separates_nulls() {
        let col: ArrayRef = Arc::new(StringArray::from(vec![
            Some("b"),
            Some("a"),
            None,
            Some("a"),
        ]));
        let groups = RowGroups::from_columns(&[col]).expect("groupby");
        assert_eq!(groups.ngroups(), 3);
        // Nulls sort first.
        assert_eq!(groups.group(0), &[2]);
        let mut a_rows = groups.group(1).to_vec();
        a_rows.sort();
        assert_eq!(a_rows, vec![1, 3]);
        assert_eq!(groups.group(2), &[0]);
    }

    #[test]
    fn joint_groupby_uses_both_columns() {
        let c0: ArrayRef = Arc::new(StringArray::from(vec!["x", "x", "y", "x"]));
        let c1: ArrayRef = Arc::new(StringArray::from(vec!["1", "2", "1", "1"]));
        let groups = RowGroups::from_columns(&[c0, c1]).expect("groupby");
        // (x,1) x2, (x,2), (y,1)
        assert_eq!(groups.ngroups(), 3);
        let sizes: Vec<usize> = (0..3).map(|g| groups.group(g).len()).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
    }

    #[test]
    fn numeric_groupby_works_too() {
        let col: ArrayRef = Arc::new(Float64Array::from(vec![1.0, 2.0, 1.0]));
        let groups = RowGroups::from_columns(&[col]).expect("groupby");
        assert_eq!(groups.ngroups(), 2);
        assert_eq!(groups.group(0).len(), 2);
    }
}
