// sqlx::Error -> StoreError

use bulwark_core::port::StoreError;

/// SQLite extended result codes for UNIQUE / PRIMARY KEY violations
const UNIQUE_VIOLATION_CODES: [&str; 2] = ["2067", "1555"];

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| UNIQUE_VIOLATION_CODES.contains(&code.as_ref())),
        _ => false,
    }
}

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            // https://www.sqlite.org/rescode.html
            Some(code) => match code.as_ref() {
                "5" => StoreError::Backend(format!(
                    "Database locked (SQLITE_BUSY): {}",
                    db_err.message()
                )),
                "13" => StoreError::Backend(format!("Database full: {}", db_err.message())),
                code_str => StoreError::Backend(format!(
                    "Database error [{}]: {}",
                    code_str,
                    db_err.message()
                )),
            },
            None => StoreError::Backend(format!("Database error: {}", db_err.message())),
        },
        sqlx::Error::PoolTimedOut => StoreError::Backend("Connection pool timed out".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            StoreError::Backend(format!("Column not found: {}", col))
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

/// Stored JSON that no longer parses
pub(crate) fn corrupt(what: &str, id: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("Corrupt {} `{}`: {}", what, id, err))
}
