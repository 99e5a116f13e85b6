//! SQL migration definitions for the KnowledgeForge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Knowledge store: revision, entity versions, triples, commit log",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Store-wide revision, bumped once per successful commit
CREATE TABLE IF NOT EXISTS store_revision (
    id       INTEGER PRIMARY KEY CHECK (id = 1),
    revision INTEGER NOT NULL
);
INSERT OR IGNORE INTO store_revision (id, revision) VALUES (1, 0);

-- Optimistic concurrency tokens per subject entity
CREATE TABLE IF NOT EXISTS entity_versions (
    entity_key TEXT PRIMARY KEY,
    version    INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

-- Committed triples with provenance
CREATE TABLE IF NOT EXISTS triples (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    domain            TEXT NOT NULL,
    subject_key       TEXT NOT NULL,
    subject_name      TEXT NOT NULL,
    subject_type      TEXT NOT NULL,
    predicate         TEXT NOT NULL,
    object_key        TEXT NOT NULL,
    object_name       TEXT NOT NULL,
    object_type       TEXT NOT NULL,
    source_id         TEXT NOT NULL,
    anchor            TEXT NOT NULL,
    extracted_at      TEXT NOT NULL,
    extractor_version TEXT NOT NULL,
    confidence        REAL NOT NULL,
    package_hash      TEXT NOT NULL,
    revision          INTEGER NOT NULL,
    UNIQUE(domain, subject_key, predicate, object_key, source_id)
);

CREATE INDEX IF NOT EXISTS idx_triples_domain ON triples(domain);
CREATE INDEX IF NOT EXISTS idx_triples_subject ON triples(subject_key);

-- Successful commits, keyed by package content hash (idempotency)
CREATE TABLE IF NOT EXISTS commit_log (
    package_hash TEXT PRIMARY KEY,
    source_id    TEXT NOT NULL,
    domain       TEXT NOT NULL,
    revision     INTEGER NOT NULL,
    triples      INTEGER NOT NULL,
    result_json  TEXT NOT NULL,
    committed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_commit_log_domain ON commit_log(domain, revision);

-- Schema rejection counters and dead letters
CREATE TABLE IF NOT EXISTS schema_rejections (
    package_hash     TEXT PRIMARY KEY,
    source_id        TEXT NOT NULL,
    domain           TEXT NOT NULL,
    attempts         INTEGER NOT NULL,
    diagnostics_json TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    package_hash     TEXT PRIMARY KEY,
    source_id        TEXT NOT NULL,
    domain           TEXT NOT NULL,
    attempts         INTEGER NOT NULL,
    diagnostics_json TEXT NOT NULL,
    dead_lettered_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Service records, status transitions, promotion decisions, audit log",
            sql: r#"
CREATE TABLE IF NOT EXISTS service_records (
    id               TEXT PRIMARY KEY,
    role_id          TEXT NOT NULL,
    revision_from    INTEGER NOT NULL,
    revision_to      INTEGER NOT NULL,
    test_suite_id    TEXT NOT NULL,
    pass_rate        REAL NOT NULL,
    completeness     REAL NOT NULL,
    semantic_version TEXT NOT NULL,
    lineage_json     TEXT NOT NULL,
    status           TEXT NOT NULL,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_service_records_role ON service_records(role_id, created_at);

-- Append-only status history
CREATE TABLE IF NOT EXISTS service_transitions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id  TEXT NOT NULL REFERENCES service_records(id),
    from_status TEXT NOT NULL,
    to_status   TEXT NOT NULL,
    reason      TEXT NOT NULL,
    at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_service_transitions_service ON service_transitions(service_id);

-- Append-only decision log
CREATE TABLE IF NOT EXISTS promotion_decisions (
    id              TEXT PRIMARY KEY,
    candidate_id    TEXT NOT NULL,
    baseline_id     TEXT NOT NULL,
    parity          REAL NOT NULL,
    stage           TEXT NOT NULL,
    decision        TEXT NOT NULL,
    terminal        INTEGER NOT NULL,
    tasks_evaluated INTEGER NOT NULL,
    evaluator_id    TEXT NOT NULL,
    decided_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_promotion_decisions_candidate ON promotion_decisions(candidate_id, decided_at);

-- Append-only audit log
CREATE TABLE IF NOT EXISTS audit_events (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind         TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    recorded_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_events_kind ON audit_events(kind);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
