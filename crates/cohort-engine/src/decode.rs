use crate::aggregate::AggregateRow;
use crate::criteria::Criteria;
use crate::error::CohortResult;
use crate::labels::{BitField, Label, LabelCatalog};
use serde::{Deserialize, Serialize};

/// Name of the leading per-group total in every series.
pub const ALL_DATA: &str = "ALL_DATA";

/// Chart-ready counts: `labels[0]` is [`ALL_DATA`], followed by one display name per requested
/// label. Every entry's `data` lines up with `labels`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub data: Vec<SeriesEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesEntry {
    #[serde(rename = "type")]
    pub group: String,
    pub data: Vec<u64>,
}

/// The normalized grouping echoed back to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConditionEcho {
    pub group_by: String,
    pub selection: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortResponse {
    pub group_condition: GroupConditionEcho,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medical_conditions: Option<ChartSeries>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatments: Option<ChartSeries>,
}

impl CohortResponse {
    pub fn new(criteria: &Criteria, field: BitField, series: ChartSeries) -> Self {
        let mut response = Self {
            group_condition: GroupConditionEcho {
                group_by: criteria.group.dimension.to_string(),
                selection: criteria.group.selection.clone(),
            },
            medical_conditions: None,
            treatments: None,
        };
        match field {
            BitField::MedicalCondition => response.medical_conditions = Some(series),
            BitField::Treatment => response.treatments = Some(series),
        }
        response
    }

    pub fn series(&self, field: BitField) -> Option<&ChartSeries> {
        match field {
            BitField::MedicalCondition => self.medical_conditions.as_ref(),
            BitField::Treatment => self.treatments.as_ref(),
        }
    }
}

/// Decode aggregate rows for the label keys in `keys`, looking display names up in `catalog`.
///
/// Keys missing from the catalog fail with `UnknownLabel` before any row is decoded.
pub fn decode(
    rows: Vec<AggregateRow>,
    field: BitField,
    keys: &[String],
    catalog: &LabelCatalog,
) -> CohortResult<ChartSeries> {
    let labels = catalog.resolve(field, keys)?;
    Ok(decode_resolved(rows, &labels))
}

/// Decode aggregate rows whose counts are aligned with the already resolved `labels`.
pub fn decode_resolved(rows: Vec<AggregateRow>, labels: &[Label]) -> ChartSeries {
    let mut header = Vec::with_capacity(labels.len() + 1);
    header.push(ALL_DATA.to_string());
    header.extend(labels.iter().map(|l| l.name.clone()));

    let data = rows
        .into_iter()
        .map(|row| {
            let mut values = Vec::with_capacity(row.counts.len() + 1);
            values.push(row.total);
            values.extend(row.counts);
            SeriesEntry {
                group: row.group,
                data: values,
            }
        })
        .collect();

    ChartSeries {
        labels: header,
        data,
    }
}
