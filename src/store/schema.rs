pub const SCHEMA: &str = r#"
-- Versioned schema documents; exactly one row is current
CREATE TABLE IF NOT EXISTS schema (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    current INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now'))
);

-- Every resource of every spec, discriminated by type
CREATE TABLE IF NOT EXISTS resources (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    parent_id TEXT,
    parent_field_name TEXT,
    parent_canonical_url TEXT,
    canonical_url TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    doc TEXT NOT NULL
);

-- In-flight and finished mutation/propagation records
CREATE TABLE IF NOT EXISTS updates (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    finished_at TEXT,
    error TEXT
);

-- API tokens; user tokens act for a user resource
CREATE TABLE IF NOT EXISTS tokens (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL,
    token_lookup TEXT NOT NULL UNIQUE,
    is_admin INTEGER NOT NULL DEFAULT 0,
    user_id TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    expires_at TEXT,
    last_used_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_resources_type_parent ON resources(type, parent_id);
CREATE INDEX IF NOT EXISTS idx_resources_type_parent_url ON resources(type, parent_canonical_url, parent_field_name);
CREATE INDEX IF NOT EXISTS idx_resources_canonical_url ON resources(canonical_url);
CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id);
"#;
