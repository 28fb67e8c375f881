use crate::criteria::Dimension;
use crate::labels::BitField;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text columns of the base dataset that predicates can compare against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Column {
    State,
    PayType,
    Cohort,
}

impl Column {
    pub const ALL: [Column; 3] = [Column::State, Column::PayType, Column::Cohort];

    /// Storage column name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Column::State => "state",
            Column::PayType => "paytyp",
            Column::Cohort => "pop",
        }
    }

    /// Parse a column name. Pay type and cohort accept every [`Dimension`] alias.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "state" | "states" => Some(Column::State),
            other => Dimension::from_alias(other).map(Dimension::column),
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the base dataset. The engine only ever reads records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub patid: i64,
    pub state: String,
    pub paytyp: String,
    pub pop: String,
    pub medical_condition: u64,
    pub treatment: u64,
}

impl Record {
    pub fn text(&self, column: Column) -> &str {
        match column {
            Column::State => &self.state,
            Column::PayType => &self.paytyp,
            Column::Cohort => &self.pop,
        }
    }

    pub fn mask(&self, field: BitField) -> u64 {
        match field {
            BitField::MedicalCondition => self.medical_condition,
            BitField::Treatment => self.treatment,
        }
    }
}
