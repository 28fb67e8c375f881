//! Predicate to SQL rendering.
//!
//! Identifiers only ever come from the closed [`Column`]/[`BitField`] enums; every value a client
//! can influence is emitted as a `?` placeholder with a matching entry in `params`.
use cohort_engine::{BitExtraction, BitField, Column, CompiledFilter, Predicate};
use rusqlite::types::Value;
use std::fmt::Write as _;

/// Columns copied into a working set.
pub(crate) const WORKING_SET_COLUMNS: &str = "medical_condition, treatment, paytyp, state, pop";

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

pub(crate) fn column(column: Column) -> &'static str {
    column.as_str()
}

pub(crate) fn mask_column(field: BitField) -> &'static str {
    field.label_type()
}

/// Render a predicate as a boolean SQL expression.
pub(crate) fn render(predicate: &Predicate) -> SqlFragment {
    let mut out = SqlFragment {
        sql: String::new(),
        params: Vec::new(),
    };
    render_into(predicate, &mut out);
    out
}

fn render_into(predicate: &Predicate, out: &mut SqlFragment) {
    match predicate {
        Predicate::True => out.sql.push('1'),
        Predicate::False => out.sql.push('0'),
        Predicate::And(children) => join(children, " AND ", out),
        Predicate::Or(children) => join(children, " OR ", out),
        Predicate::Eq { column: col, value } => {
            let _ = write!(out.sql, "{} = ?", column(*col));
            out.params.push(Value::Text(value.clone()));
        }
        Predicate::MaskAll { field, bits } => {
            let _ = write!(out.sql, "({} & ?) = ?", mask_column(*field));
            out.params.push(Value::Integer(*bits as i64));
            out.params.push(Value::Integer(*bits as i64));
        }
        Predicate::MaskAny { field, bits } => {
            let _ = write!(out.sql, "({} & ?) <> 0", mask_column(*field));
            out.params.push(Value::Integer(*bits as i64));
        }
    }
}

fn join(children: &[Predicate], sep: &str, out: &mut SqlFragment) {
    out.sql.push('(');
    for (idx, child) in children.iter().enumerate() {
        if idx > 0 {
            out.sql.push_str(sep);
        }
        render_into(child, out);
    }
    out.sql.push(')');
}

/// `CREATE TEMP TABLE` statement materializing the rows matched by `predicate`.
pub(crate) fn create_working_set(name: &str, predicate: &Predicate) -> SqlFragment {
    let filter = render(predicate);
    SqlFragment {
        sql: format!(
            "CREATE TEMP TABLE {name} AS SELECT {WORKING_SET_COLUMNS} FROM patients_info WHERE {}",
            filter.sql
        ),
        params: filter.params,
    }
}

/// Grouped count query over a working set: group value, total, then one count per requested
/// label in request order.
pub(crate) fn aggregate_query(
    working_set: &str,
    filter: &CompiledFilter,
    extraction: &BitExtraction,
) -> SqlFragment {
    let group = column(filter.group_by.column());
    let mask = mask_column(extraction.field());

    let mut sql = format!("SELECT {group}, COUNT(*)");
    let mut params = Vec::with_capacity(extraction.len() + filter.selection.len());
    for position in extraction.positions() {
        // Shift before summing so a group of any size cannot overflow a 64-bit SUM.
        let _ = write!(sql, ", SUM(({mask} >> ?) & 1)");
        params.push(Value::Integer(i64::from(position)));
    }

    let having = render(&filter.group_predicate);
    let _ = write!(
        sql,
        " FROM temp.{working_set} GROUP BY {group} HAVING {} ORDER BY {group}",
        having.sql
    );
    params.extend(having.params);

    SqlFragment { sql, params }
}
