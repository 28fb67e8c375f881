use rusqlite::Connection;

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Base records. Bit-fields are stored as signed INTEGER, so bit 63 is never used.
        CREATE TABLE IF NOT EXISTS patients_info (
          patid INTEGER PRIMARY KEY,
          medical_condition INTEGER NOT NULL DEFAULT 0 CHECK (medical_condition >= 0),
          treatment INTEGER NOT NULL DEFAULT 0 CHECK (treatment >= 0),
          paytyp TEXT,
          state TEXT,
          pop TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_patients_state ON patients_info(state);
        CREATE INDEX IF NOT EXISTS idx_patients_paytyp ON patients_info(paytyp);
        CREATE INDEX IF NOT EXISTS idx_patients_pop ON patients_info(pop);

        -- label_val is the mask weight of the label (1 << bit position).
        CREATE TABLE IF NOT EXISTS label_info (
          name TEXT PRIMARY KEY,
          label_type TEXT NOT NULL,
          label TEXT NOT NULL,
          label_val INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_label_info_type ON label_info(label_type);

        CREATE TABLE IF NOT EXISTS users (
          userid TEXT PRIMARY KEY,
          auth_token TEXT
        );
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('patients_info', 'label_info', 'users')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn negative_masks_are_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        let err = conn.execute(
            "INSERT INTO patients_info (medical_condition, treatment) VALUES (-1, 0)",
            [],
        );
        assert!(err.is_err());
    }
}
