/*!
 * Store layout checks and connection setup.
 *
 * The sentence store is created by an external bootstrap step; this module
 * only verifies that it has the expected layout. `create_tables` builds the
 * same layout for fresh stores and tests.
 */

use log::debug;
use rusqlite::Connection;

use crate::errors::StoreError;

/// Columns the translator relies on in the `sentences` table
const REQUIRED_SENTENCE_COLUMNS: [&str; 5] =
    ["book_id", "para_id", "line_id", "source_text", "translated_text"];

/// Busy timeout applied to every connection, in milliseconds
const BUSY_TIMEOUT_MS: u32 = 60_000;

/// Apply the pragmas used by the writer connection
pub fn configure_writer(conn: &Connection) -> Result<(), StoreError> {
    // journal_mode returns a row, so it cannot go through execute_batch
    let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    debug!("Store journal mode: {}", mode);

    conn.execute_batch(&format!(
        r#"
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        PRAGMA cache_size=-64000;
        PRAGMA busy_timeout={};
        "#,
        BUSY_TIMEOUT_MS
    ))?;

    Ok(())
}

/// Apply the pragmas used by read-only connections
pub fn configure_reader(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(&format!("PRAGMA busy_timeout={};", BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// Whether a table exists in the store
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Verify that the `sentences` table exists with every required column
pub fn verify_schema(conn: &Connection) -> Result<(), StoreError> {
    if !table_exists(conn, "sentences")? {
        return Err(StoreError::Schema("table 'sentences' does not exist".to_string()));
    }

    let mut stmt = conn.prepare("PRAGMA table_info(sentences)")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;

    let missing: Vec<&str> = REQUIRED_SENTENCE_COLUMNS
        .iter()
        .copied()
        .filter(|required| !columns.iter().any(|c| c == required))
        .collect();

    if !missing.is_empty() {
        return Err(StoreError::Schema(format!(
            "table 'sentences' is missing column(s): {}",
            missing.join(", ")
        )));
    }

    Ok(())
}

/// Create the sentence and book tables if they do not exist
pub fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sentences (
            book_id TEXT NOT NULL,
            para_id INTEGER NOT NULL,
            line_id INTEGER NOT NULL,
            source_text TEXT NOT NULL,
            translated_text TEXT,
            PRIMARY KEY (book_id, para_id, line_id)
        );

        CREATE TABLE IF NOT EXISTS books (
            book_id TEXT PRIMARY KEY,
            ref_id TEXT
        );
        "#,
    )?;

    Ok(())
}
