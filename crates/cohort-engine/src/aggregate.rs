use crate::backend::RecordStore;
use crate::cancel::CancelToken;
use crate::error::{CohortError, CohortResult};
use crate::labels::{BitField, Label};
use crate::predicate::CompiledFilter;
use std::collections::HashMap;

/// Which bits to count, in the order the caller asked for them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitExtraction {
    field: BitField,
    labels: Vec<Label>,
}

impl BitExtraction {
    pub fn new(field: BitField, labels: Vec<Label>) -> Self {
        debug_assert!(labels.iter().all(|l| l.field == field));
        Self { field, labels }
    }

    pub fn field(&self) -> BitField {
        self.field
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn positions(&self) -> impl Iterator<Item = u32> + '_ {
        self.labels.iter().map(|l| l.position)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Shape raw store output into the final aggregate rows.
    ///
    /// Groups outside the selection are dropped, selected groups without any matching record
    /// get an all-zero row, and rows follow the selection order.
    pub fn finish(
        &self,
        filter: &CompiledFilter,
        groups: Vec<GroupCounts>,
    ) -> CohortResult<Vec<AggregateRow>> {
        let mut by_group: HashMap<String, GroupCounts> = HashMap::with_capacity(groups.len());
        for group in groups {
            if group.counts.len() != self.labels.len() {
                return Err(CohortError::StoreUnavailable {
                    message: format!(
                        "store returned {} label counts for group {:?}, expected {}",
                        group.counts.len(),
                        group.group,
                        self.labels.len()
                    ),
                    source: None,
                });
            }
            if let Some(existing) = by_group.get_mut(&group.group) {
                existing.merge(&group);
            } else {
                by_group.insert(group.group.clone(), group);
            }
        }

        let rows = filter
            .selection
            .iter()
            .map(|value| match by_group.remove(value) {
                Some(group) => AggregateRow {
                    group: group.group,
                    total: group.total,
                    counts: group.counts,
                },
                None => AggregateRow {
                    group: value.clone(),
                    total: 0,
                    counts: vec![0; self.labels.len()],
                },
            })
            .collect();

        if !by_group.is_empty() {
            log::debug!(
                "dropped {} group(s) outside the {} selection",
                by_group.len(),
                filter.group_by
            );
        }

        Ok(rows)
    }
}

/// Per-group counts as produced by a [`RecordStore`], `counts` aligned with
/// [`BitExtraction::labels`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupCounts {
    pub group: String,
    pub total: u64,
    pub counts: Vec<u64>,
}

impl GroupCounts {
    pub fn empty(group: impl Into<String>, width: usize) -> Self {
        Self {
            group: group.into(),
            total: 0,
            counts: vec![0; width],
        }
    }

    /// Count one bitmask towards this group.
    pub fn add(&mut self, mask: u64, positions: impl Iterator<Item = u32>) {
        self.total += 1;
        for (slot, bit) in self.counts.iter_mut().zip(positions) {
            *slot += (mask >> bit) & 1;
        }
    }

    fn merge(&mut self, other: &GroupCounts) {
        self.total += other.total;
        for (slot, add) in self.counts.iter_mut().zip(&other.counts) {
            *slot += add;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateRow {
    pub group: String,
    pub total: u64,
    pub counts: Vec<u64>,
}

/// Run the extraction for one request against `store`.
pub fn aggregate<S: RecordStore + ?Sized>(
    store: &S,
    filter: &CompiledFilter,
    extraction: &BitExtraction,
    cancel: &CancelToken,
) -> CohortResult<Vec<AggregateRow>> {
    if filter.selects_no_groups() {
        log::debug!("no states selected, skipping the store");
        return Ok(Vec::new());
    }
    if filter.is_unsatisfiable() {
        log::debug!("predicate is unsatisfiable, skipping the store");
        return extraction.finish(filter, Vec::new());
    }
    cancel.check()?;
    let groups = store.aggregate(filter, extraction, cancel)?;
    extraction.finish(filter, groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Dimension;
    use crate::predicate::Predicate;
    use pretty_assertions::assert_eq;

    fn label(position: u32, key: &str) -> Label {
        Label {
            field: BitField::Treatment,
            position,
            key: key.into(),
            name: key.to_uppercase(),
        }
    }

    fn filter(selection: &[&str]) -> CompiledFilter {
        CompiledFilter {
            row_predicate: Predicate::True,
            state_predicate: Predicate::True,
            group_by: Dimension::PayType,
            group_predicate: Predicate::True,
            selection: selection.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn add_counts_bits_in_extraction_order() {
        let extraction = BitExtraction::new(BitField::Treatment, vec![label(2, "c"), label(0, "a")]);
        let mut group = GroupCounts::empty("A", extraction.len());
        group.add(0b101, extraction.positions());
        group.add(0b001, extraction.positions());
        assert_eq!(group.total, 2);
        assert_eq!(group.counts, vec![1, 2]);
    }

    #[test]
    fn finish_orders_by_selection_fills_gaps_and_drops_strays() {
        let extraction = BitExtraction::new(BitField::Treatment, vec![label(0, "a")]);
        let groups = vec![
            GroupCounts {
                group: "Z".into(),
                total: 9,
                counts: vec![9],
            },
            GroupCounts {
                group: "A".into(),
                total: 3,
                counts: vec![1],
            },
        ];
        let rows = extraction.finish(&filter(&["B", "A"]), groups).unwrap();
        assert_eq!(
            rows,
            vec![
                AggregateRow {
                    group: "B".into(),
                    total: 0,
                    counts: vec![0],
                },
                AggregateRow {
                    group: "A".into(),
                    total: 3,
                    counts: vec![1],
                },
            ]
        );
    }

    #[test]
    fn finish_rejects_misaligned_store_output() {
        let extraction = BitExtraction::new(BitField::Treatment, vec![label(0, "a")]);
        let groups = vec![GroupCounts {
            group: "A".into(),
            total: 1,
            counts: vec![],
        }];
        assert!(matches!(
            extraction.finish(&filter(&["A"]), groups),
            Err(CohortError::StoreUnavailable { .. })
        ));
    }
}
