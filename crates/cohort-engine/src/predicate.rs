//! Row predicates compiled from [`Criteria`].
//!
//! Predicates are a small expression tree rather than query text. The in-memory store evaluates
//! the tree directly; SQL backends render it with bound parameters, so request values never end
//! up spliced into a statement.
use crate::criteria::{BitConstraint, Criteria, Dimension};
use crate::labels::BitField;
use crate::record::{Column, Record};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    True,
    False,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Eq { column: Column, value: String },
    /// `(mask & bits) == bits`
    MaskAll { field: BitField, bits: u64 },
    /// `(mask & bits) != 0`
    MaskAny { field: BitField, bits: u64 },
}

impl Predicate {
    /// Conjunction with constant folding: `True` children vanish, a `False` child wins, nested
    /// conjunctions are flattened and an empty conjunction is `True`.
    pub fn and(parts: impl IntoIterator<Item = Predicate>) -> Predicate {
        let mut out = Vec::new();
        for part in parts {
            match part {
                Predicate::True => {}
                Predicate::False => return Predicate::False,
                Predicate::And(children) => out.extend(children),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Predicate::True,
            1 => out.pop().unwrap_or(Predicate::True),
            _ => Predicate::And(out),
        }
    }

    /// Disjunction with constant folding. An empty disjunction is `False`.
    pub fn or(parts: impl IntoIterator<Item = Predicate>) -> Predicate {
        let mut out = Vec::new();
        for part in parts {
            match part {
                Predicate::False => {}
                Predicate::True => return Predicate::True,
                Predicate::Or(children) => out.extend(children),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Predicate::False,
            1 => out.pop().unwrap_or(Predicate::False),
            _ => Predicate::Or(out),
        }
    }

    /// `column` equals any of `values`.
    pub fn any_eq<'a>(column: Column, values: impl IntoIterator<Item = &'a String>) -> Predicate {
        Predicate::or(values.into_iter().map(|v| Predicate::Eq {
            column,
            value: v.clone(),
        }))
    }

    pub fn bits(field: BitField, constraint: &BitConstraint) -> Predicate {
        let all = constraint.all_of.map(|bits| {
            if bits == 0 {
                Predicate::True
            } else {
                Predicate::MaskAll { field, bits }
            }
        });
        let any = constraint.any_of.map(|bits| {
            if bits == 0 {
                Predicate::False
            } else {
                Predicate::MaskAny { field, bits }
            }
        });
        Predicate::and(all.into_iter().chain(any))
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Predicate::False)
    }

    pub fn evaluate(&self, record: &Record) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::And(children) => children.iter().all(|p| p.evaluate(record)),
            Predicate::Or(children) => children.iter().any(|p| p.evaluate(record)),
            Predicate::Eq { column, value } => record.text(*column) == value,
            Predicate::MaskAll { field, bits } => record.mask(*field) & bits == *bits,
            Predicate::MaskAny { field, bits } => record.mask(*field) & bits != 0,
        }
    }
}

/// Renders the predicate shape with `?` in place of compared text, suitable for logs.
impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, children: &[Predicate], sep: &str) -> fmt::Result {
            f.write_str("(")?;
            for (idx, child) in children.iter().enumerate() {
                if idx > 0 {
                    f.write_str(sep)?;
                }
                write!(f, "{child}")?;
            }
            f.write_str(")")
        }

        match self {
            Predicate::True => f.write_str("TRUE"),
            Predicate::False => f.write_str("FALSE"),
            Predicate::And(children) => join(f, children, " AND "),
            Predicate::Or(children) => join(f, children, " OR "),
            Predicate::Eq { column, .. } => write!(f, "{column} = ?"),
            Predicate::MaskAll { field, bits } => write!(f, "{field} & {bits} = {bits}"),
            Predicate::MaskAny { field, bits } => write!(f, "{field} & {bits} <> 0"),
        }
    }
}

/// Everything a record store needs to build and aggregate one request's working set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledFilter {
    /// Row selection over the base records.
    pub row_predicate: Predicate,
    /// The state part of `row_predicate` on its own.
    pub state_predicate: Predicate,
    pub group_by: Dimension,
    /// Selection re-applied to grouped output (`HAVING`).
    pub group_predicate: Predicate,
    pub selection: Vec<String>,
}

impl CompiledFilter {
    /// Whether no record can possibly match.
    pub fn is_unsatisfiable(&self) -> bool {
        self.row_predicate.is_false()
    }

    /// Whether the response has no groups at all. Only an empty state list does that; any other
    /// unsatisfiable filter still reports every selected group, with zero counts.
    pub fn selects_no_groups(&self) -> bool {
        self.state_predicate.is_false()
    }
}

/// Translate criteria into the row predicate
/// `states AND selection AND medical bits AND treatment bits`.
///
/// An empty state list makes the predicate `False` (nothing matches), while a bit-field without
/// AND/OR entries contributes no constraint at all.
pub fn compile(criteria: &Criteria) -> CompiledFilter {
    let group_column = criteria.group.dimension.column();
    let group_predicate = Predicate::any_eq(group_column, &criteria.group.selection);
    let state_predicate = Predicate::any_eq(Column::State, &criteria.states);

    let row_predicate = Predicate::and([
        state_predicate.clone(),
        group_predicate.clone(),
        Predicate::bits(
            BitField::MedicalCondition,
            &criteria.medical_conditions.constraint,
        ),
        Predicate::bits(BitField::Treatment, &criteria.treatments.constraint),
    ]);

    CompiledFilter {
        row_predicate,
        state_predicate,
        group_by: criteria.group.dimension,
        group_predicate,
        selection: criteria.group.selection.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{FieldCriteria, GroupCondition};
    use pretty_assertions::assert_eq;

    fn record(state: &str, pop: &str, medical: u64, treatment: u64) -> Record {
        Record {
            patid: 0,
            state: state.into(),
            paytyp: "Commercial".into(),
            pop: pop.into(),
            medical_condition: medical,
            treatment,
        }
    }

    fn criteria(states: &[&str], medical: BitConstraint) -> Criteria {
        Criteria {
            group: GroupCondition {
                dimension: Dimension::Cohort,
                selection: vec!["A".into(), "B".into()],
            },
            states: states.iter().map(|s| s.to_string()).collect(),
            medical_conditions: FieldCriteria {
                constraint: medical,
                labels: Vec::new(),
            },
            treatments: FieldCriteria::default(),
        }
    }

    #[test]
    fn constant_folding() {
        assert_eq!(Predicate::and([]), Predicate::True);
        assert_eq!(Predicate::or([]), Predicate::False);
        assert_eq!(
            Predicate::and([Predicate::True, Predicate::False]),
            Predicate::False
        );
        assert_eq!(
            Predicate::or([Predicate::False, Predicate::True]),
            Predicate::True
        );
        let eq = Predicate::Eq {
            column: Column::State,
            value: "NJ".into(),
        };
        assert_eq!(Predicate::and([Predicate::True, eq.clone()]), eq);
    }

    #[test]
    fn empty_states_compile_to_false() {
        let filter = compile(&criteria(&[], BitConstraint::default()));
        assert!(filter.is_unsatisfiable());
        assert!(filter.selects_no_groups());
        assert!(!filter.row_predicate.evaluate(&record("NJ", "A", 0, 0)));
    }

    #[test]
    fn zero_or_mask_matches_nothing_but_keeps_groups() {
        let filter = compile(&criteria(
            &["NJ"],
            BitConstraint {
                all_of: None,
                any_of: Some(0),
            },
        ));
        assert!(filter.is_unsatisfiable());
        assert!(!filter.selects_no_groups());
    }

    #[test]
    fn unconstrained_bit_fields_do_not_filter() {
        let filter = compile(&criteria(&["NJ"], BitConstraint::default()));
        assert!(filter.row_predicate.evaluate(&record("NJ", "A", 0, 0)));
        assert!(!filter.row_predicate.evaluate(&record("NY", "A", 0, 0)));
        assert!(!filter.row_predicate.evaluate(&record("NJ", "C", 0, 0)));
    }

    #[test]
    fn and_and_or_lists_combine() {
        let filter = compile(&criteria(
            &["NJ"],
            BitConstraint {
                all_of: Some(0b001),
                any_of: Some(0b110),
            },
        ));
        assert!(filter.row_predicate.evaluate(&record("NJ", "A", 0b011, 0)));
        assert!(filter.row_predicate.evaluate(&record("NJ", "B", 0b101, 0)));
        assert!(!filter.row_predicate.evaluate(&record("NJ", "A", 0b001, 0)));
        assert!(!filter.row_predicate.evaluate(&record("NJ", "A", 0b110, 0)));
    }

    #[test]
    fn display_hides_compared_text() {
        let filter = compile(&criteria(
            &["NJ"],
            BitConstraint {
                all_of: Some(3),
                any_of: None,
            },
        ));
        assert_eq!(
            filter.row_predicate.to_string(),
            "(state = ? AND (pop = ? OR pop = ?) AND medical_condition & 3 = 3)"
        );
    }
}
