//! Label catalog: maps bit positions of each bit-field to machine keys and display names.
//!
//! Bit extraction assumes that the positions inside one bit-field are dense (`0..N`) and unique,
//! so the catalog refuses to load otherwise instead of silently misaligning labels and counts.
use crate::error::{CohortError, CohortResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

/// Highest number of usable bits per bit-field. Masks are stored as signed 64-bit integers, so
/// the sign bit is never assigned to a label.
pub const MAX_BIT_POSITIONS: u32 = 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitField {
    MedicalCondition,
    Treatment,
}

impl BitField {
    pub const ALL: [BitField; 2] = [BitField::MedicalCondition, BitField::Treatment];

    /// Catalog `label_type` value, which is also the record column holding the mask.
    pub const fn label_type(self) -> &'static str {
        match self {
            BitField::MedicalCondition => "medical_condition",
            BitField::Treatment => "treatment",
        }
    }

    /// Key of this bit-field in request and response payloads.
    pub const fn response_key(self) -> &'static str {
        match self {
            BitField::MedicalCondition => "medical_conditions",
            BitField::Treatment => "treatments",
        }
    }

    pub fn from_label_type(label_type: &str) -> Option<Self> {
        BitField::ALL
            .into_iter()
            .find(|f| f.label_type() == label_type)
    }

    const fn index(self) -> usize {
        match self {
            BitField::MedicalCondition => 0,
            BitField::Treatment => 1,
        }
    }
}

impl fmt::Display for BitField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_type())
    }
}

impl FromStr for BitField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "medical" | "medical_condition" | "medical_conditions" | "medicals" => {
                Ok(BitField::MedicalCondition)
            }
            "treatment" | "treatments" => Ok(BitField::Treatment),
            other => Err(format!("unknown bit-field `{other}`")),
        }
    }
}

/// A catalog row as persisted by the label store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRow {
    pub name: String,
    pub label_type: String,
    pub label: String,
    /// Mask weight of the label, `1 << position`.
    pub label_val: i64,
}

impl LabelRow {
    /// A row for bit `position` of `field`.
    ///
    /// Positions at or beyond [`MAX_BIT_POSITIONS`] get `label_val` 0, which
    /// [`LabelCatalog::from_rows`] rejects.
    pub fn new(field: BitField, position: u32, label: &str, name: &str) -> Self {
        let label_val = if position < MAX_BIT_POSITIONS {
            1i64 << position
        } else {
            0
        };
        Self {
            name: name.to_string(),
            label_type: field.label_type().to_string(),
            label: label.to_string(),
            label_val,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    #[serde(rename = "label_type")]
    pub field: BitField,
    pub position: u32,
    #[serde(rename = "label")]
    pub key: String,
    pub name: String,
}

impl Label {
    pub fn mask(&self) -> u64 {
        1u64 << self.position
    }
}

#[derive(Clone, Debug, Default)]
struct FieldLabels {
    labels: Vec<Label>,
    by_key: HashMap<String, usize>,
}

/// Validated, read-only label reference data for both bit-fields.
#[derive(Clone, Debug, Default)]
pub struct LabelCatalog {
    fields: [FieldLabels; 2],
}

impl LabelCatalog {
    pub fn from_rows(rows: impl IntoIterator<Item = LabelRow>) -> CohortResult<Self> {
        let mut grouped: [Vec<Label>; 2] = [Vec::new(), Vec::new()];

        for row in rows {
            let Some(field) = BitField::from_label_type(&row.label_type) else {
                log::debug!(
                    "skipping label {:?} with unsupported label_type {:?}",
                    row.name,
                    row.label_type
                );
                continue;
            };
            let position = position_of(&row)?;
            if row.label.trim().is_empty() {
                return Err(CohortError::InvalidCatalog(format!(
                    "label {:?} has an empty machine key",
                    row.name
                )));
            }
            grouped[field.index()].push(Label {
                field,
                position,
                key: row.label,
                name: row.name,
            });
        }

        let mut catalog = LabelCatalog::default();
        for field in BitField::ALL {
            let mut labels = std::mem::take(&mut grouped[field.index()]);
            labels.sort_by_key(|l| l.position);

            let mut by_key = HashMap::with_capacity(labels.len());
            for (idx, label) in labels.iter().enumerate() {
                if label.position as usize != idx {
                    let detail = if idx > 0 && labels[idx - 1].position == label.position {
                        format!("duplicate bit position {}", label.position)
                    } else {
                        format!("missing bit position {idx}")
                    };
                    return Err(CohortError::InvalidCatalog(format!("{field}: {detail}")));
                }
                if by_key.insert(label.key.clone(), idx).is_some() {
                    return Err(CohortError::InvalidCatalog(format!(
                        "{field}: duplicate label key {:?}",
                        label.key
                    )));
                }
            }

            catalog.fields[field.index()] = FieldLabels { labels, by_key };
        }

        Ok(catalog)
    }

    /// Labels of one bit-field, ordered by bit position.
    pub fn labels(&self, field: BitField) -> &[Label] {
        &self.fields[field.index()].labels
    }

    pub fn get(&self, field: BitField, key: &str) -> Option<&Label> {
        let entry = &self.fields[field.index()];
        entry.by_key.get(key).map(|&idx| &entry.labels[idx])
    }

    /// Resolve requested label keys, keeping the caller's order.
    pub fn resolve(&self, field: BitField, keys: &[String]) -> CohortResult<Vec<Label>> {
        keys.iter()
            .map(|key| {
                self.get(field, key)
                    .cloned()
                    .ok_or_else(|| CohortError::UnknownLabel {
                        field,
                        label: key.clone(),
                    })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fields.iter().map(|f| f.labels.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn position_of(row: &LabelRow) -> CohortResult<u32> {
    let value = row.label_val;
    if value <= 0 || (value & (value - 1)) != 0 {
        return Err(CohortError::InvalidCatalog(format!(
            "label {:?} has label_val {value}, expected a power of two",
            row.name
        )));
    }
    let position = value.trailing_zeros();
    if position >= MAX_BIT_POSITIONS {
        return Err(CohortError::InvalidCatalog(format!(
            "label {:?} uses bit {position}, at most {MAX_BIT_POSITIONS} bits are supported",
            row.name
        )));
    }
    Ok(position)
}

/// Source of catalog rows, typically the label table of the record database.
pub trait LabelSource {
    fn load_labels(&self) -> CohortResult<Vec<LabelRow>>;
}

impl LabelSource for [LabelRow] {
    fn load_labels(&self) -> CohortResult<Vec<LabelRow>> {
        Ok(self.to_vec())
    }
}

impl LabelSource for Vec<LabelRow> {
    fn load_labels(&self) -> CohortResult<Vec<LabelRow>> {
        Ok(self.clone())
    }
}

/// Shared catalog snapshot.
///
/// Requests hold an `Arc` of the catalog they started with, so a concurrent [`refresh`] never
/// changes labels underneath a running aggregation.
///
/// [`refresh`]: CatalogCache::refresh
#[derive(Debug)]
pub struct CatalogCache {
    current: RwLock<Arc<LabelCatalog>>,
}

impl CatalogCache {
    pub fn new(catalog: LabelCatalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog)),
        }
    }

    pub fn load(source: &(impl LabelSource + ?Sized)) -> CohortResult<Self> {
        let catalog = LabelCatalog::from_rows(source.load_labels()?)?;
        log::info!("loaded label catalog with {} labels", catalog.len());
        Ok(Self::new(catalog))
    }

    pub fn snapshot(&self) -> Arc<LabelCatalog> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Reload from `source`. On failure the previous catalog stays in place.
    pub fn refresh(&self, source: &(impl LabelSource + ?Sized)) -> CohortResult<()> {
        let catalog = LabelCatalog::from_rows(source.load_labels()?)?;
        log::info!("refreshed label catalog with {} labels", catalog.len());
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(catalog);
        Ok(())
    }
}
