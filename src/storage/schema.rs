//! SQLite schema for run records.
//!
//! Child rows are keyed by run id. Nested attributes (configuration, progress,
//! scores, outcomes, detail payloads) are stored as JSON text columns. Lists
//! are returned in `rowid` order, which is insertion order.

/// Runs table.
pub const CREATE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id                  TEXT PRIMARY KEY,
    status              TEXT NOT NULL,
    phase               TEXT,
    config              TEXT NOT NULL,
    progress            TEXT NOT NULL,
    summary             TEXT,
    pre_combine_winner  TEXT,
    winner              TEXT,
    total_cost          REAL NOT NULL DEFAULT 0,
    cancel_reason       TEXT,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT
)
"#;

/// Generated documents table.
pub const CREATE_GENERATED_DOCUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS generated_documents (
    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    id                  TEXT NOT NULL,
    seq                 INTEGER NOT NULL,
    body                TEXT NOT NULL,
    success             INTEGER NOT NULL,
    PRIMARY KEY (run_id, id)
)
"#;

/// Single evaluation results table.
pub const CREATE_SINGLE_EVAL_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS single_eval_results (
    id                  TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    candidate_id        TEXT NOT NULL,
    judge               TEXT NOT NULL,
    body                TEXT NOT NULL
)
"#;

/// Pairwise results table.
pub const CREATE_PAIRWISE_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pairwise_results (
    id                  TEXT PRIMARY KEY,
    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    stage               TEXT NOT NULL,
    body                TEXT NOT NULL
)
"#;

/// Elo ratings table.
pub const CREATE_ELO_RATINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS elo_ratings (
    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    stage               TEXT NOT NULL,
    candidate_id        TEXT NOT NULL,
    rating              REAL NOT NULL,
    wins                INTEGER NOT NULL,
    losses              INTEGER NOT NULL,
    ties                INTEGER NOT NULL,
    seq                 INTEGER NOT NULL,
    PRIMARY KEY (run_id, stage, candidate_id)
)
"#;

/// Combined documents table.
pub const CREATE_COMBINED_DOCUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS combined_documents (
    run_id              TEXT PRIMARY KEY REFERENCES runs(id) ON DELETE CASCADE,
    body                TEXT NOT NULL
)
"#;

/// Timeline events table. `seq` preserves insertion order.
pub const CREATE_TIMELINE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS timeline_events (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    id                  TEXT NOT NULL UNIQUE,
    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    phase               TEXT NOT NULL,
    event_type          TEXT NOT NULL,
    success             INTEGER NOT NULL,
    body                TEXT NOT NULL
)
"#;

pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)
"#;

pub const CREATE_TIMELINE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_timeline_events_run ON timeline_events(run_id, seq)
"#;

pub const CREATE_SINGLE_EVAL_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_single_eval_results_run ON single_eval_results(run_id)
"#;

pub const CREATE_PAIRWISE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pairwise_results_run ON pairwise_results(run_id, stage)
"#;

/// Returns all schema statements in order of execution.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_RUNS_TABLE,
        CREATE_GENERATED_DOCUMENTS_TABLE,
        CREATE_SINGLE_EVAL_RESULTS_TABLE,
        CREATE_PAIRWISE_RESULTS_TABLE,
        CREATE_ELO_RATINGS_TABLE,
        CREATE_COMBINED_DOCUMENTS_TABLE,
        CREATE_TIMELINE_EVENTS_TABLE,
        CREATE_INDEXES,
        CREATE_TIMELINE_INDEX,
        CREATE_SINGLE_EVAL_INDEX,
        CREATE_PAIRWISE_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const RUNS: &str = "runs";
    pub const GENERATED_DOCUMENTS: &str = "generated_documents";
    pub const SINGLE_EVAL_RESULTS: &str = "single_eval_results";
    pub const PAIRWISE_RESULTS: &str = "pairwise_results";
    pub const ELO_RATINGS: &str = "elo_ratings";
    pub const COMBINED_DOCUMENTS: &str = "combined_documents";
    pub const TIMELINE_EVENTS: &str = "timeline_events";

    /// All tables, parents first.
    pub const ALL: [&str; 7] = [
        RUNS,
        GENERATED_DOCUMENTS,
        SINGLE_EVAL_RESULTS,
        PAIRWISE_RESULTS,
        ELO_RATINGS,
        COMBINED_DOCUMENTS,
        TIMELINE_EVENTS,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_has_a_create_statement() {
        let statements = all_schema_statements();
        for table in tables::ALL {
            let needle = format!("CREATE TABLE IF NOT EXISTS {} ", table);
            assert!(
                statements.iter().any(|s| s.contains(&needle)),
                "missing table {}",
                table
            );
        }
    }

    #[test]
    fn test_statements_are_single() {
        for statement in all_schema_statements() {
            assert!(!statement.trim().trim_end_matches(';').contains(';'));
        }
    }
}
