/// MIGRATION 0001: Recognition cache table.
pub const MIGRATION_0001: &str = r#"
-- Cache entries: one serialized recognition result per namespaced key.
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    expires_at INTEGER NOT NULL, -- Unix timestamp in milliseconds
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

-- Expiry sweeps scan by deadline
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries (expires_at);
"#;
