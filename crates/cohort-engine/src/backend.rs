use crate::aggregate::{BitExtraction, GroupCounts};
use crate::cancel::CancelToken;
use crate::error::CohortResult;
use crate::predicate::CompiledFilter;
use crate::record::{Column, Record};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Rows scanned between two cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Storage abstraction for the record set queried by the engine.
///
/// Implementations must keep each call's working set private to that call and release it before
/// returning, on success and on every error path.
pub trait RecordStore: fmt::Debug + Send + Sync {
    /// Filter by `filter.row_predicate`, group by `filter.group_by` and count, per group, all
    /// rows plus the rows having each bit of `extraction` set.
    ///
    /// Only groups with at least one matching row need to be returned; the engine fills in and
    /// orders the selection afterwards. Long-running implementations should poll `cancel`.
    fn aggregate(
        &self,
        filter: &CompiledFilter,
        extraction: &BitExtraction,
        cancel: &CancelToken,
    ) -> CohortResult<Vec<GroupCounts>>;

    /// Distinct non-empty values of a text column, sorted ascending.
    fn distinct_values(&self, column: Column) -> CohortResult<Vec<String>>;
}

impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    fn aggregate(
        &self,
        filter: &CompiledFilter,
        extraction: &BitExtraction,
        cancel: &CancelToken,
    ) -> CohortResult<Vec<GroupCounts>> {
        (**self).aggregate(filter, extraction, cancel)
    }

    fn distinct_values(&self, column: Column) -> CohortResult<Vec<String>> {
        (**self).distinct_values(column)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    records: Vec<Record>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn aggregate(
        &self,
        filter: &CompiledFilter,
        extraction: &BitExtraction,
        cancel: &CancelToken,
    ) -> CohortResult<Vec<GroupCounts>> {
        // The working set borrows from the store and lives only for this call.
        let mut working_set: Vec<&Record> = Vec::new();
        for (idx, record) in self.records.iter().enumerate() {
            if idx % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check()?;
            }
            if filter.row_predicate.evaluate(record) {
                working_set.push(record);
            }
        }

        let column = filter.group_by.column();
        let field = extraction.field();
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<GroupCounts> = Vec::new();
        for (idx, record) in working_set.into_iter().enumerate() {
            if idx % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check()?;
            }
            let key = record.text(column);
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push(GroupCounts::empty(key, extraction.len()));
                groups.len() - 1
            });
            groups[slot].add(record.mask(field), extraction.positions());
        }

        Ok(groups)
    }

    fn distinct_values(&self, column: Column) -> CohortResult<Vec<String>> {
        let values: BTreeSet<&str> = self
            .records
            .iter()
            .map(|r| r.text(column))
            .filter(|v| !v.is_empty())
            .collect();
        Ok(values.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Dimension;
    use crate::error::CohortError;
    use crate::labels::{BitField, Label};
    use crate::predicate::Predicate;
    use pretty_assertions::assert_eq;

    fn store() -> InMemoryRecordStore {
        let mut store = InMemoryRecordStore::new();
        for (state, paytyp, mask) in [("NJ", "Medicare", 0b01), ("NY", "Commercial", 0b11), ("NJ", "Commercial", 0b10)] {
            store.push(Record {
                patid: 0,
                state: state.into(),
                paytyp: paytyp.into(),
                pop: "Adult".into(),
                medical_condition: mask,
                treatment: 0,
            });
        }
        store
    }

    fn everything() -> CompiledFilter {
        CompiledFilter {
            row_predicate: Predicate::True,
            state_predicate: Predicate::True,
            group_by: Dimension::PayType,
            group_predicate: Predicate::True,
            selection: vec![],
        }
    }

    #[test]
    fn groups_in_first_seen_order() {
        let extraction = BitExtraction::new(
            BitField::MedicalCondition,
            vec![Label {
                field: BitField::MedicalCondition,
                position: 1,
                key: "b".into(),
                name: "B".into(),
            }],
        );
        let groups = store()
            .aggregate(&everything(), &extraction, &CancelToken::new())
            .unwrap();
        assert_eq!(
            groups,
            vec![
                GroupCounts {
                    group: "Medicare".into(),
                    total: 1,
                    counts: vec![0],
                },
                GroupCounts {
                    group: "Commercial".into(),
                    total: 2,
                    counts: vec![2],
                },
            ]
        );
    }

    #[test]
    fn cancelled_token_stops_the_scan() {
        let token = CancelToken::new();
        token.cancel();
        let extraction = BitExtraction::new(BitField::MedicalCondition, vec![]);
        let err = store()
            .aggregate(&everything(), &extraction, &token)
            .unwrap_err();
        assert!(matches!(err, CohortError::Cancelled));
    }

    #[test]
    fn distinct_values_are_sorted() {
        assert_eq!(
            store().distinct_values(Column::State).unwrap(),
            vec!["NJ".to_string(), "NY".to_string()]
        );
    }
}
