// crates/db/src/migrations.rs
// Inline SQL migrations for the fact log and its reference tables.
//
// The rollup tables are not here: their columns follow the stat catalog and
// are generated by `schema.rs`, then reconciled on every open.

pub const MIGRATIONS: &[&str] = &[
    // Time buckets. The start instant (unix seconds, UTC) is the natural key.
    r#"
CREATE TABLE IF NOT EXISTS weeks (
    id          INTEGER PRIMARY KEY,
    week_start  INTEGER NOT NULL UNIQUE
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS months (
    id           INTEGER PRIMARY KEY,
    month_start  INTEGER NOT NULL UNIQUE
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS sessions (
    id          INTEGER PRIMARY KEY,
    start_time  INTEGER NOT NULL,
    end_time    INTEGER NOT NULL,
    week_id     INTEGER NOT NULL REFERENCES weeks(id),
    month_id    INTEGER NOT NULL REFERENCES months(id),
    CHECK (start_time <= end_time)
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS tourneys (
    id               INTEGER PRIMARY KEY,
    tourney_type_id  INTEGER NOT NULL,
    session_id       INTEGER
);
"#,
    // Hand-level attributes shared by every player fact of the hand.
    r#"
CREATE TABLE IF NOT EXISTS hands (
    id           INTEGER PRIMARY KEY,
    start_time   INTEGER NOT NULL,
    gametype_id  INTEGER NOT NULL,
    tourney_id   INTEGER REFERENCES tourneys(id),
    session_id   INTEGER,
    seats        INTEGER NOT NULL
);
"#,
    "CREATE INDEX IF NOT EXISTS idx_hands_session ON hands(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_tourneys_session ON tourneys(session_id)",
    // Append-only fact log. `seq` is the rebuild watermark; AUTOINCREMENT
    // keeps it from ever being reused.
    r#"
CREATE TABLE IF NOT EXISTS hand_players (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    hand_id       INTEGER NOT NULL REFERENCES hands(id),
    player_id     INTEGER NOT NULL,
    max_position  INTEGER NOT NULL,
    position      TEXT NOT NULL,
    start_cards   INTEGER NOT NULL DEFAULT 0,
    stats         TEXT NOT NULL,
    recorded_at   INTEGER NOT NULL,
    UNIQUE(hand_id, player_id)
);
"#,
    "CREATE INDEX IF NOT EXISTS idx_hand_players_player ON hand_players(player_id)",
    // Bookkeeping for full rebuilds; one row per rollup table.
    r#"
CREATE TABLE IF NOT EXISTS rollup_meta (
    table_name      TEXT PRIMARY KEY,
    rebuilt_at      INTEGER NOT NULL,
    fact_watermark  INTEGER NOT NULL,
    row_count       INTEGER NOT NULL,
    fingerprint     TEXT NOT NULL
);
"#,
    // Cross-process first-insert lock (store_row lock mode).
    r#"
CREATE TABLE IF NOT EXISTS rollup_lock (
    id           INTEGER PRIMARY KEY DEFAULT 1 CHECK (id = 1),
    holder       TEXT,
    acquired_at  INTEGER
);
"#,
    "INSERT OR IGNORE INTO rollup_lock (id) VALUES (1)",
    // Cross-process rebuild gate (store_row lock mode): one swap claim, and
    // one row per writer inside the gate.
    r#"
CREATE TABLE IF NOT EXISTS rollup_swap (
    id           INTEGER PRIMARY KEY DEFAULT 1 CHECK (id = 1),
    holder       TEXT,
    acquired_at  INTEGER
);
"#,
    "INSERT OR IGNORE INTO rollup_swap (id) VALUES (1)",
    r#"
CREATE TABLE IF NOT EXISTS rollup_writers (
    holder      TEXT PRIMARY KEY,
    entered_at  INTEGER NOT NULL
);
"#,
    // Bumped by every in-place rewrite of recorded facts (session
    // reassignment). A rebuild compares it across its two phases.
    r#"
CREATE TABLE IF NOT EXISTS fact_revision (
    id        INTEGER PRIMARY KEY DEFAULT 1 CHECK (id = 1),
    revision  INTEGER NOT NULL DEFAULT 0
);
"#,
    "INSERT OR IGNORE INTO fact_revision (id) VALUES (1)",
];
