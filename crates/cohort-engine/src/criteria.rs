//! Client filter requests and their validated form.
//!
//! [`CohortRequest`] mirrors the wire shape exactly (every part optional) so that a malformed
//! request can be reported precisely. [`CohortRequest::validate`] turns it into a [`Criteria`],
//! the only input the predicate compiler accepts.
use crate::error::{CohortError, CohortResult};
use crate::labels::{BitField, MAX_BIT_POSITIONS};
use crate::record::Column;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Largest mask a request may carry; the sign bit is never a label.
pub const MAX_MASK: u64 = (1u64 << MAX_BIT_POSITIONS) - 1;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortRequest {
    pub group_condition: Option<GroupConditionRequest>,
    pub states: Option<Vec<String>>,
    pub medical_conditions: Option<BitFieldRequest>,
    pub treatments: Option<BitFieldRequest>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConditionRequest {
    pub group_by: Option<String>,
    pub selection: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitFieldRequest {
    #[serde(rename = "AND", skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<u64>>,
    #[serde(rename = "OR", skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<u64>>,
    /// Label keys to extract when this bit-field is the one being aggregated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

/// Grouping dimension, normalized from the aliases clients send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dimension {
    PayType,
    Cohort,
}

impl Dimension {
    pub fn from_alias(alias: &str) -> Option<Self> {
        match alias.trim().to_ascii_lowercase().as_str() {
            "paytype" | "paytyp" | "payment-type" | "payer-type" | "pay_type" => {
                Some(Dimension::PayType)
            }
            "cohort" | "pop" | "population" => Some(Dimension::Cohort),
            _ => None,
        }
    }

    pub const fn column(self) -> Column {
        match self {
            Dimension::PayType => Column::PayType,
            Dimension::Cohort => Column::Cohort,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column().as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupCondition {
    pub dimension: Dimension,
    /// Retained dimension values, de-duplicated, in request order.
    pub selection: Vec<String>,
}

/// Bit constraint on one bit-field. `None` means the list was absent or empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitConstraint {
    /// Every bit in the mask must be set.
    pub all_of: Option<u64>,
    /// At least one bit in the mask must be set.
    pub any_of: Option<u64>,
}

impl BitConstraint {
    pub fn is_unconstrained(&self) -> bool {
        self.all_of.is_none() && self.any_of.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldCriteria {
    pub constraint: BitConstraint,
    /// Requested label keys, in the order the response series must follow.
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Criteria {
    pub group: GroupCondition,
    pub states: Vec<String>,
    pub medical_conditions: FieldCriteria,
    pub treatments: FieldCriteria,
}

impl Criteria {
    pub fn field(&self, field: BitField) -> &FieldCriteria {
        match field {
            BitField::MedicalCondition => &self.medical_conditions,
            BitField::Treatment => &self.treatments,
        }
    }
}

impl CohortRequest {
    pub fn from_json(json: &str) -> CohortResult<Self> {
        serde_json::from_str(json).map_err(|e| CohortError::invalid(format!("malformed request: {e}")))
    }

    pub fn from_value(value: serde_json::Value) -> CohortResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| CohortError::invalid(format!("malformed request: {e}")))
    }

    pub fn field(&self, field: BitField) -> Option<&BitFieldRequest> {
        match field {
            BitField::MedicalCondition => self.medical_conditions.as_ref(),
            BitField::Treatment => self.treatments.as_ref(),
        }
    }

    /// Check that the request is complete and normalize it.
    ///
    /// Runs without touching any store, so invalid requests fail before a working set exists.
    pub fn validate(&self) -> CohortResult<Criteria> {
        let group = self
            .group_condition
            .as_ref()
            .ok_or_else(|| CohortError::invalid("group_condition is required"))?;

        let alias = group
            .group_by
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| CohortError::invalid("group_condition.group_by is required"))?;
        let dimension = Dimension::from_alias(alias)
            .ok_or_else(|| CohortError::invalid(format!("unknown group_by dimension `{alias}`")))?;

        let selection = non_empty_values("group_condition.selection", group.selection.as_deref())?;
        let states = non_empty_values("states", self.states.as_deref())?;

        Ok(Criteria {
            group: GroupCondition {
                dimension,
                selection,
            },
            states,
            medical_conditions: field_criteria(BitField::MedicalCondition, self.medical_conditions.as_ref())?,
            treatments: field_criteria(BitField::Treatment, self.treatments.as_ref())?,
        })
    }
}

fn non_empty_values(what: &str, values: Option<&[String]>) -> CohortResult<Vec<String>> {
    let values = values
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CohortError::invalid(format!("{what} must be a non-empty list")))?;

    let mut seen = HashSet::with_capacity(values.len());
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        if value.trim().is_empty() {
            return Err(CohortError::invalid(format!("{what} contains an empty value")));
        }
        if seen.insert(value.as_str()) {
            out.push(value.clone());
        }
    }
    Ok(out)
}

fn field_criteria(field: BitField, request: Option<&BitFieldRequest>) -> CohortResult<FieldCriteria> {
    let Some(request) = request else {
        return Ok(FieldCriteria::default());
    };

    let constraint = BitConstraint {
        all_of: combine_masks(field, "AND", request.and.as_deref())?,
        any_of: combine_masks(field, "OR", request.or.as_deref())?,
    };

    let mut labels = Vec::new();
    let mut seen = HashSet::new();
    for key in request.labels.iter().flatten() {
        if key.trim().is_empty() {
            return Err(CohortError::invalid(format!(
                "{}.labels contains an empty label",
                field.response_key()
            )));
        }
        if !seen.insert(key.as_str()) {
            return Err(CohortError::invalid(format!(
                "{}.labels lists `{key}` more than once",
                field.response_key()
            )));
        }
        labels.push(key.clone());
    }

    Ok(FieldCriteria { constraint, labels })
}

/// OR the masks of one list together. An absent or empty list is no constraint.
fn combine_masks(field: BitField, list: &str, masks: Option<&[u64]>) -> CohortResult<Option<u64>> {
    let Some(masks) = masks.filter(|m| !m.is_empty()) else {
        return Ok(None);
    };

    let mut combined = 0u64;
    for &mask in masks {
        if mask == 0 || mask > MAX_MASK {
            return Err(CohortError::invalid(format!(
                "{}.{list} mask {mask} is out of range 1..={MAX_MASK}",
                field.response_key()
            )));
        }
        combined |= mask;
    }
    Ok(Some(combined))
}
