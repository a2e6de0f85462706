use rusqlite::Connection;

use crate::error::Result;

/// Initialise the publication schema in `conn`.
///
/// Idempotent. Timestamps are stored as fixed-width RFC 3339 UTC strings
/// (microsecond precision, `Z` suffix) so that text comparison orders them.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS posts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     INTEGER NOT NULL,
            title       TEXT    NOT NULL,
            content     TEXT    NOT NULL,
            status      TEXT    NOT NULL DEFAULT 'draft'
                        CHECK (status IN ('draft', 'scheduled', 'published', 'failed')),
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS platforms (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        INTEGER NOT NULL,
            platform_name  TEXT    NOT NULL,
            api_config     TEXT    NOT NULL DEFAULT '{}',  -- JSON: channel id -> token
            is_active      INTEGER NOT NULL DEFAULT 1,
            created_at     TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_platforms_user ON platforms (user_id, platform_name);

        CREATE TABLE IF NOT EXISTS post_destinations (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id        INTEGER NOT NULL REFERENCES posts (id) ON DELETE CASCADE,
            platform_id    INTEGER NOT NULL REFERENCES platforms (id),
            scheduled_for  TEXT    NOT NULL,
            published_at   TEXT,
            status         TEXT    NOT NULL DEFAULT 'scheduled'
                           CHECK (status IN ('scheduled', 'processing', 'kafka_ready',
                                             'kafka_processed', 'published', 'failed')),
            error_message  TEXT,
            event_sent     INTEGER NOT NULL DEFAULT 0,
            event_sent_at  TEXT,
            claimed_at     TEXT,
            attempts       INTEGER NOT NULL DEFAULT 0,
            retry_at       TEXT,
            created_at     TEXT    NOT NULL
        ) STRICT;

        -- Claim query: WHERE status = 'scheduled' AND event_sent = 0 ORDER BY scheduled_for
        CREATE INDEX IF NOT EXISTS idx_destinations_due
            ON post_destinations (status, event_sent, scheduled_for);

        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            destination_id  INTEGER NOT NULL REFERENCES post_destinations (id) ON DELETE CASCADE,
            channel_id      TEXT    NOT NULL,
            attempt         INTEGER NOT NULL,
            succeeded       INTEGER NOT NULL,
            error           TEXT,
            attempted_at    TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_attempts_destination
            ON delivery_attempts (destination_id);
        ",
    )?;
    Ok(())
}
