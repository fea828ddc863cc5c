//! Database schema constants and SQL queries.
//!
//! Court IDs are the short PACER identifiers (`nysd`, `cand`, ...). Caselink
//! IDs are stored as integers so that ordering and `MAX` are numeric.

/// SQL schema for creating the courts table.
pub const CREATE_COURTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS courts (
    id VARCHAR(15) PRIMARY KEY,
    full_name TEXT NOT NULL DEFAULT '',
    jurisdiction VARCHAR(3) NOT NULL,
    in_use BOOLEAN NOT NULL DEFAULT TRUE,
    end_date DATE
)
"#;

/// SQL schema for creating the dockets table.
pub const CREATE_DOCKETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS dockets (
    id BIGSERIAL PRIMARY KEY,
    court_id VARCHAR(15) NOT NULL,
    pacer_case_id BIGINT NOT NULL,
    docket_number TEXT NOT NULL,
    case_name TEXT,
    date_filed DATE,
    source VARCHAR(32) NOT NULL DEFAULT 'iquery',
    date_created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    date_modified TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (court_id, pacer_case_id)
)
"#;

pub const CREATE_DOCKETS_COURT_CASE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_dockets_court_case ON dockets (court_id, pacer_case_id DESC)
"#;

pub const CREATE_DOCKETS_COURT_FILED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_dockets_court_filed ON dockets (court_id, date_filed DESC)
"#;

/// Inserts a docket or fills in missing fields of an existing one.
/// `inserted` is true only for a new row.
pub const UPSERT_DOCKET: &str = r#"
INSERT INTO dockets (court_id, pacer_case_id, docket_number, case_name, date_filed)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (court_id, pacer_case_id) DO UPDATE SET
    docket_number = EXCLUDED.docket_number,
    case_name = COALESCE(EXCLUDED.case_name, dockets.case_name),
    date_filed = COALESCE(EXCLUDED.date_filed, dockets.date_filed),
    date_modified = NOW()
RETURNING (xmax = 0) AS inserted
"#;

pub const SELECT_MAX_CASE_ID: &str =
    "SELECT MAX(pacer_case_id) FROM dockets WHERE court_id = $1";

/// Latest caselink ID among cases filed in `[$2, $3)`.
pub const SELECT_LATEST_CASE_ID_FILED_BETWEEN: &str = r#"
SELECT pacer_case_id FROM dockets
WHERE court_id = $1 AND date_filed >= $2 AND date_filed < $3
ORDER BY date_filed DESC, pacer_case_id DESC
LIMIT 1
"#;

/// District and bankruptcy courts on PACER, minus `$1`.
pub const SELECT_PACER_COURTS: &str = r#"
SELECT id FROM courts
WHERE jurisdiction IN ('FD', 'FB')
  AND in_use
  AND end_date IS NULL
  AND id <> ALL($1)
ORDER BY id
"#;

/// Courts whose caselink IDs are not crawled through iquery.
pub const EXCLUDED_COURTS: [&str; 3] = ["uscfc", "arb", "cit"];

/// Schema migrations as `(name, statement)`, in application order. Names
/// are recorded once applied and must never change.
pub const MIGRATIONS: [(&str, &str); 4] = [
    ("0001_create_courts", CREATE_COURTS_TABLE),
    ("0002_create_dockets", CREATE_DOCKETS_TABLE),
    ("0003_index_dockets_court_case", CREATE_DOCKETS_COURT_CASE_INDEX),
    ("0004_index_dockets_court_filed", CREATE_DOCKETS_COURT_FILED_INDEX),
];
