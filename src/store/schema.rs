//! Database schema constants for the job store.

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    pipeline_type VARCHAR(50) NOT NULL,
    status VARCHAR(50) NOT NULL,
    step VARCHAR(100),
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    history JSONB NOT NULL DEFAULT '[]'::jsonb,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL for creating all required indexes.
///
/// The (pipeline_type, status) index serves claim and watchdog scans; the
/// updated_at index serves staleness queries.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_type_status ON jobs(pipeline_type, status);
CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_JOBS_TABLE, CREATE_INDEXES]
}
