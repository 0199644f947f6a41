//! Postgres schema for events, snapshots, and scheduled commands.

use sqlx::PgPool;

/// Idempotent DDL for every table the Postgres adapters use.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID        NOT NULL UNIQUE,
    aggregate_id    UUID        NOT NULL,
    aggregate_type  TEXT        NOT NULL,
    sequence_number BIGINT      NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT        NOT NULL,
    actor           TEXT        NULL,
    etag            TEXT        NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB       NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (aggregate_id, sequence_number)
);

CREATE INDEX IF NOT EXISTS events_occurred_at_idx
    ON events (aggregate_id, occurred_at);

CREATE TABLE IF NOT EXISTS snapshots (
    aggregate_id   UUID        NOT NULL,
    aggregate_type TEXT        NOT NULL,
    version        BIGINT      NOT NULL CHECK (version > 0),
    last_event_at  TIMESTAMPTZ NULL,
    state          JSONB       NOT NULL,
    etags          JSONB       NOT NULL DEFAULT '[]'::jsonb,
    created_at     TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (aggregate_id, version)
);

ALTER TABLE snapshots ADD COLUMN IF NOT EXISTS last_event_at TIMESTAMPTZ NULL;

CREATE TABLE IF NOT EXISTS scheduled_commands (
    aggregate_id                 UUID        NOT NULL,
    sequence_number              BIGINT      NOT NULL CHECK (sequence_number > 0),
    aggregate_type               TEXT        NOT NULL,
    command_name                 TEXT        NOT NULL,
    command                      JSONB       NOT NULL,
    created_at                   TIMESTAMPTZ NOT NULL,
    due_time                     TIMESTAMPTZ NULL,
    precondition_aggregate_id    UUID        NULL,
    precondition_sequence_number BIGINT      NULL,
    attempts                     INTEGER     NOT NULL DEFAULT 0,
    last_error                   TEXT        NULL,
    applied_time                 TIMESTAMPTZ NULL,
    final_attempt_time           TIMESTAMPTZ NULL,
    PRIMARY KEY (aggregate_id, sequence_number),
    CHECK (applied_time IS NULL OR final_attempt_time IS NULL)
);

CREATE INDEX IF NOT EXISTS scheduled_commands_due_idx
    ON scheduled_commands (due_time NULLS FIRST, aggregate_id, sequence_number)
    WHERE applied_time IS NULL AND final_attempt_time IS NULL;
"#;

/// Create any missing tables and indexes.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
