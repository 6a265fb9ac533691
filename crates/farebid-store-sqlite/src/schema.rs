//! SQL schema for the Farebid SQLite store.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per ride. The full aggregate lives in `body`; the other columns
-- are projections used for lookups and the compare-and-swap guard.
CREATE TABLE IF NOT EXISTS rides (
    ride_id     TEXT PRIMARY KEY,
    rider_id    TEXT NOT NULL,
    driver_id   TEXT,
    status      TEXT NOT NULL,   -- 'requested' | 'accepted' | 'started' | 'completed' | 'cancelled'
    version     INTEGER NOT NULL,
    created_at  TEXT NOT NULL,   -- RFC 3339, fixed width
    body        TEXT NOT NULL    -- JSON-encoded Ride
);

CREATE TABLE IF NOT EXISTS drivers (
    driver_id         TEXT PRIMARY KEY,
    latitude          REAL,
    longitude         REAL,
    rating            REAL NOT NULL,
    avg_fare          TEXT,            -- canonical decimal text
    avg_response_secs REAL,
    available         INTEGER NOT NULL,
    updated_at        TEXT NOT NULL
);

-- Append-only apart from the single pending -> resolved update.
CREATE TABLE IF NOT EXISTS notifications (
    notification_id TEXT PRIMARY KEY,
    ride_id         TEXT NOT NULL REFERENCES rides(ride_id),
    driver_id       TEXT NOT NULL,
    status          TEXT NOT NULL,   -- 'pending' | 'bid' | 'declined' | 'expired'
    created_at      TEXT NOT NULL,
    body            TEXT NOT NULL    -- JSON-encoded DriverNotification
);

-- Chat between a ride's rider and its assigned driver. Only `read_at` is
-- ever updated.
CREATE TABLE IF NOT EXISTS messages (
    message_id   TEXT PRIMARY KEY,
    ride_id      TEXT NOT NULL REFERENCES rides(ride_id),
    sender_id    TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    body         TEXT NOT NULL,
    sent_at      TEXT NOT NULL,
    read_at      TEXT
);

CREATE INDEX IF NOT EXISTS rides_rider_idx          ON rides(rider_id);
CREATE INDEX IF NOT EXISTS rides_driver_idx         ON rides(driver_id);
CREATE INDEX IF NOT EXISTS rides_status_idx         ON rides(status);
CREATE INDEX IF NOT EXISTS drivers_position_idx     ON drivers(latitude, longitude);
CREATE INDEX IF NOT EXISTS notifications_ride_idx   ON notifications(ride_id);
CREATE INDEX IF NOT EXISTS notifications_status_idx ON notifications(status, created_at);
CREATE INDEX IF NOT EXISTS messages_ride_idx        ON messages(ride_id, sent_at);
CREATE INDEX IF NOT EXISTS messages_recipient_idx   ON messages(recipient_id, read_at);

PRAGMA user_version = 1;
";
