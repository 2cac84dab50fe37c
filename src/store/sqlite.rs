use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;

use super::schema::SCHEMA;
use super::{IndexKind, Store, eval, exec};
use crate::error::{Error, Result};
use crate::plan::{CmpOp, Filter, Pipeline};
use crate::schema::SchemaDef;
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An unshared in-memory database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_doc(body: &str) -> Result<Document> {
    serde_json::from_str(body).map_err(Error::from)
}

/// Columns extracted from a document for indexing and pushdown.
struct Columns {
    id: String,
    spec: String,
    parent_id: Option<String>,
    parent_field_name: Option<String>,
    parent_canonical_url: Option<String>,
    canonical_url: Option<String>,
    version: i64,
}

impl Columns {
    fn of(doc: &Document) -> Result<Self> {
        let owned = |field: &str| doc_str(doc, field).map(str::to_string);
        Ok(Self {
            id: owned(ID).ok_or_else(|| Error::Invariant("resource without _id".into()))?,
            spec: owned(TYPE).ok_or_else(|| Error::Invariant("resource without _type".into()))?,
            parent_id: owned(PARENT_ID),
            parent_field_name: owned(PARENT_FIELD_NAME),
            parent_canonical_url: owned(PARENT_CANONICAL_URL),
            canonical_url: owned(CANONICAL_URL),
            version: doc_version(doc),
        })
    }
}

/// Maps reserved fields to their extracted column.
fn column(field: &str) -> Option<&'static str> {
    match field {
        ID => Some("id"),
        TYPE => Some("type"),
        PARENT_ID => Some("parent_id"),
        PARENT_FIELD_NAME => Some("parent_field_name"),
        PARENT_CANONICAL_URL => Some("parent_canonical_url"),
        CANONICAL_URL => Some("canonical_url"),
        _ => None,
    }
}

fn sql_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Number(n) => n.as_i64().map(SqlValue::Integer),
        _ => None,
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn json_path(field: &str) -> String {
    format!("$.\"{field}\"")
}

/// SQL membership test for `field` against `count` bound values.
///
/// Reserved fields use their column. Plain document fields go through
/// `json_each` so arrays match on any element; `x._id` reaches into arrays
/// of link entries.
fn membership(field: &str, count: usize, params: &mut Vec<SqlValue>) -> Option<String> {
    let marks = vec!["?"; count].join(", ");
    if let Some(col) = column(field) {
        return Some(format!("{col} IN ({marks})"));
    }
    match field.split_once('.') {
        None => {
            params.push(SqlValue::Text(json_path(field)));
            Some(format!(
                "EXISTS (SELECT 1 FROM json_each(doc, ?) WHERE value IN ({marks}))"
            ))
        }
        Some((head, ID)) if !head.contains('.') => {
            params.push(SqlValue::Text(json_path(head)));
            Some(format!(
                "EXISTS (SELECT 1 FROM json_each(doc, ?) \
                 WHERE (CASE WHEN type = 'object' THEN json_extract(value, '$._id') END) IN ({marks}))"
            ))
        }
        _ => None,
    }
}

/// Translates the parts of `filter` SQLite can evaluate.
///
/// The translation only ever narrows to a superset of the true matches; the
/// caller re-checks every row with [`eval::matches`].
fn push_down(filter: &Filter, ctx: Option<&ResourceId>, params: &mut Vec<SqlValue>) -> Option<String> {
    let mark = params.len();
    let clause = match filter {
        Filter::Cmp {
            field,
            op: CmpOp::Eq,
            value,
        } => sql_value(value).and_then(|v| {
            let clause = membership(field, 1, params)?;
            params.push(v);
            Some(clause)
        }),
        Filter::In { field, values } => {
            if values.is_empty() {
                return Some("0".into());
            }
            let bound: Option<Vec<SqlValue>> = values.iter().map(sql_value).collect();
            bound.and_then(|bound| {
                let clause = membership(field, bound.len(), params)?;
                params.extend(bound);
                Some(clause)
            })
        }
        Filter::Prefix { field, prefix } => column(field).map(|col| {
            params.push(SqlValue::Text(format!("{}%", escape_like(prefix))));
            format!("{col} LIKE ? ESCAPE '\\'")
        }),
        Filter::Context(field) => match ctx {
            None => Some("0".into()),
            Some(id) => membership(field, 1, params).map(|clause| {
                params.push(SqlValue::Text(id.as_str().to_string()));
                clause
            }),
        },
        Filter::And(parts) => {
            let clauses: Vec<String> = parts
                .iter()
                .filter_map(|part| push_down(part, ctx, params))
                .collect();
            (!clauses.is_empty()).then(|| format!("({})", clauses.join(" AND ")))
        }
        Filter::Or(parts) => {
            let clauses: Option<Vec<String>> = parts
                .iter()
                .map(|part| push_down(part, ctx, params))
                .collect();
            clauses
                .filter(|c| !c.is_empty())
                .map(|c| format!("({})", c.join(" OR ")))
        }
        _ => None,
    };
    if clause.is_none() {
        params.truncate(mark);
    }
    clause
}

fn index_name(prefix: &str, spec: &str, field: &str) -> Result<String> {
    let ident = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if !ident(spec) || !ident(field) {
        return Err(Error::BadRequest(format!("cannot index {spec}.{field}")));
    }
    Ok(format!("{prefix}__{spec}__{field}"))
}

/// Names the field behind a unique index failure, e.g. `employee.email`.
fn describe_violation(message: Option<&str>) -> String {
    let message = message.unwrap_or("unique constraint failed");
    message
        .split_once("ux__")
        .map(|(_, rest)| {
            rest.trim_end_matches(|c: char| c == '\'' || c == '"')
                .replacen("__", ".", 1)
        })
        .unwrap_or_else(|| message.to_string())
}

fn map_write_error(err: rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(e, message) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            Error::UniqueViolation(describe_violation(message.as_deref()))
        }
        e => Error::from(e),
    }
}

fn write_resource(conn: &Connection, doc: &Document, expected_version: Option<i64>) -> Result<usize> {
    let cols = Columns::of(doc)?;
    let body = serde_json::to_string(doc)?;
    let rows = match expected_version {
        None => conn.execute(
            "INSERT INTO resources (id, type, parent_id, parent_field_name, parent_canonical_url, canonical_url, version, deleted, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
            params![
                cols.id,
                cols.spec,
                cols.parent_id,
                cols.parent_field_name,
                cols.parent_canonical_url,
                cols.canonical_url,
                cols.version,
                body,
            ],
        ),
        Some(expected) => conn.execute(
            "UPDATE resources SET type = ?2, parent_id = ?3, parent_field_name = ?4, parent_canonical_url = ?5,
                 canonical_url = ?6, version = ?7, doc = ?8
             WHERE id = ?1 AND version = ?9 AND deleted = 0",
            params![
                cols.id,
                cols.spec,
                cols.parent_id,
                cols.parent_field_name,
                cols.parent_canonical_url,
                cols.canonical_url,
                cols.version,
                body,
                expected,
            ],
        ),
    };
    rows.map_err(map_write_error)
}

fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        token_hash: row.get(1)?,
        token_lookup: row.get(2)?,
        is_admin: row.get(3)?,
        user_id: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        expires_at: row.get::<_, Option<String>>(6)?.map(|s| parse_datetime(&s)),
        last_used_at: row.get::<_, Option<String>>(7)?.map(|s| parse_datetime(&s)),
    })
}

const TOKEN_COLUMNS: &str =
    "id, token_hash, token_lookup, is_admin, user_id, created_at, expires_at, last_used_at";

fn update_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, Option<String>, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Schema versions

    fn save_schema(&self, def: &SchemaDef) -> Result<()> {
        let body = serde_json::to_string(def)?;
        self.conn().execute(
            "INSERT INTO schema (id, body, current, created_at) VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            params![def.id, body, format_datetime(&Utc::now())],
        )?;
        Ok(())
    }

    fn get_schema(&self, id: &str) -> Result<Option<SchemaDef>> {
        let body: Option<String> = self
            .conn()
            .query_row("SELECT body FROM schema WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }

    fn current_schema(&self) -> Result<Option<SchemaDef>> {
        let body: Option<String> = self
            .conn()
            .query_row("SELECT body FROM schema WHERE current = 1", [], |row| row.get(0))
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }

    fn promote_schema(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("UPDATE schema SET current = 0 WHERE current = 1", [])?;
        let rows = tx.execute("UPDATE schema SET current = 1 WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    fn list_schemas(&self) -> Result<Vec<SchemaVersion>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, current, created_at FROM schema ORDER BY created_at, rowid")?;

        let rows = stmt.query_map([], |row| {
            Ok(SchemaVersion {
                id: row.get(0)?,
                current: row.get(1)?,
                created_at: parse_datetime(&row.get::<_, String>(2)?),
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Resource operations

    fn insert_resource(&self, doc: &Document) -> Result<()> {
        write_resource(&self.conn(), doc, None)?;
        Ok(())
    }

    fn get_resource(&self, id: &ResourceId) -> Result<Option<Document>> {
        let body: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM resources WHERE id = ?1 AND deleted = 0",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        body.as_deref().map(parse_doc).transpose()
    }

    fn find(&self, filter: &Filter, ctx: Option<&ResourceId>) -> Result<Vec<Document>> {
        let mut params = Vec::new();
        let mut sql = String::from("SELECT doc FROM resources WHERE deleted = 0");
        if let Some(clause) = push_down(filter, ctx, &mut params) {
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }
        sql.push_str(" ORDER BY rowid");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?;

        let mut docs = Vec::new();
        for body in rows {
            let doc = parse_doc(&body?)?;
            if eval::matches(&doc, filter, ctx) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn count(&self, filter: &Filter) -> Result<usize> {
        Ok(self.find(filter, None)?.len())
    }

    fn update_resource(
        &self,
        id: &ResourceId,
        set: &Document,
        unset: &[String],
        expected_version: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT doc, version FROM resources WHERE id = ?1 AND deleted = 0",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((body, version)) = row else {
            return Ok(false);
        };
        if expected_version.is_some_and(|expected| expected != version) {
            return Ok(false);
        }

        let mut doc = parse_doc(&body)?;
        for (key, value) in set {
            set_path(&mut doc, key, value.clone());
        }
        for key in unset {
            remove_path(&mut doc, key);
        }
        doc.insert(VERSION.to_string(), Value::from(version + 1));

        Ok(write_resource(&conn, &doc, Some(version))? > 0)
    }

    fn tombstone(&self, ids: &[ResourceId]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut total = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE resources SET deleted = 1,
                     doc = json_set(doc, '$._deleted', json('true'))
                 WHERE id = ?1 AND deleted = 0",
            )?;
            for id in ids {
                total += stmt.execute(params![id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(total)
    }

    fn rewrite_canonical_prefix(&self, old_prefix: &str, new_prefix: &str) -> Result<usize> {
        let old_prefix = old_prefix.trim_end_matches('/');
        let new_prefix = new_prefix.trim_end_matches('/');
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let candidates: Vec<String> = {
            let mut stmt = tx.prepare("SELECT doc FROM resources WHERE deleted = 0 AND instr(doc, ?1) > 0")?;
            let rows = stmt.query_map(params![old_prefix], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut changed = 0;
        for body in candidates {
            let mut doc = parse_doc(&body)?;
            let mut touched = false;
            for (key, value) in doc.iter_mut() {
                let cached = key == CANONICAL_URL || key == PARENT_CANONICAL_URL || key.starts_with(CANONICAL_URL_PREFIX);
                let rewritten = value
                    .as_str()
                    .filter(|url| cached && url_under(url, old_prefix))
                    .map(|url| format!("{new_prefix}{}", &url[old_prefix.len()..]));
                if let Some(url) = rewritten {
                    *value = Value::String(url);
                    touched = true;
                }
            }
            if touched {
                let version = doc_version(&doc);
                doc.insert(VERSION.to_string(), Value::from(version + 1));
                changed += write_resource(&tx, &doc, Some(version))?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    // Index operations

    fn ensure_index(&self, spec: &str, field: &str, kind: IndexKind) -> Result<()> {
        let path = json_path(field);
        let sql = match kind {
            IndexKind::Plain => format!(
                "CREATE INDEX IF NOT EXISTS {} ON resources(json_extract(doc, '{path}')) WHERE type = '{spec}'",
                index_name("ix", spec, field)?
            ),
            IndexKind::UniqueInParent => format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON resources(coalesce(parent_id, ''), parent_field_name, json_extract(doc, '{path}'))
                 WHERE type = '{spec}' AND deleted = 0",
                index_name("ux", spec, field)?
            ),
            IndexKind::UniqueGlobal => format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON resources(json_extract(doc, '{path}'))
                 WHERE type = '{spec}' AND deleted = 0",
                index_name("ux", spec, field)?
            ),
        };
        self.conn().execute_batch(&sql).map_err(map_write_error)
    }

    fn drop_indexes(&self, spec: &str, field: &str) -> Result<()> {
        let sql = format!(
            "DROP INDEX IF EXISTS {}; DROP INDEX IF EXISTS {};",
            index_name("ix", spec, field)?,
            index_name("ux", spec, field)?
        );
        self.conn().execute_batch(&sql)?;
        Ok(())
    }

    // Update records

    fn create_update(&self, record: &UpdateRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO updates (id, kind, payload, created_at, finished_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.kind.as_str(),
                serde_json::to_string(&record.payload)?,
                format_datetime(&record.created_at),
                record.finished_at.as_ref().map(format_datetime),
                record.error,
            ],
        )?;
        Ok(())
    }

    fn finish_update(&self, id: &str, error: Option<&str>) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE updates SET finished_at = ?1, error = ?2 WHERE id = ?3",
            params![format_datetime(&Utc::now()), error, id],
        )?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn list_updates(&self, pending_only: bool) -> Result<Vec<UpdateRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, kind, payload, created_at, finished_at, error FROM updates
             WHERE ?1 = 0 OR finished_at IS NULL ORDER BY created_at, rowid",
        )?;

        let rows = stmt.query_map(params![pending_only], update_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            let (id, kind, payload, created_at, finished_at, error) = row?;
            let kind = UpdateKind::parse(&kind)
                .ok_or_else(|| Error::Invariant(format!("unknown update kind: {kind}")))?;
            records.push(UpdateRecord {
                id,
                kind,
                payload: serde_json::from_str(&payload)?,
                created_at: parse_datetime(&created_at),
                finished_at: finished_at.as_deref().map(parse_datetime),
                error,
            });
        }
        Ok(records)
    }

    // Token operations

    fn create_token(&self, token: &Token) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO tokens (id, token_hash, token_lookup, is_admin, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token.id,
                token.token_hash,
                token.token_lookup,
                token.is_admin,
                token.user_id,
                format_datetime(&token.created_at),
                token.expires_at.as_ref().map(format_datetime),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::TokenLookupCollision)
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn get_token_by_id(&self, id: &str) -> Result<Option<Token>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?1"),
            params![id],
            token_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<Token>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE token_lookup = ?1"),
            params![lookup],
            token_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_tokens(&self, cursor: &str, limit: i32) -> Result<Vec<Token>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE id > ?1 ORDER BY id LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![cursor, limit], token_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_user_tokens(&self, user_id: &str) -> Result<Vec<Token>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;

        let rows = stmt.query_map(params![user_id], token_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_token(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM tokens WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn update_token_last_used(&self, id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE tokens SET last_used_at = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn has_admin_token(&self) -> Result<bool> {
        let conn = self.conn();
        let count: i32 = conn.query_row(
            "SELECT COUNT(*) FROM tokens WHERE is_admin = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn aggregate(&self, pipeline: &Pipeline, ctx: Option<&ResourceId>) -> Result<Vec<Document>> {
        exec::run(self, pipeline, ctx)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
