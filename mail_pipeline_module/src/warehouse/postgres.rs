use std::env;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::Row;
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::{error, info};
use uuid::Uuid;

use super::{Neighbor, Warehouse, WarehouseError, VECTOR_INDEX_NAME};
use crate::record::{AttachmentRecord, EmailRecord, EmbeddingRecord, ReplyRecord, ReplyTemplate};

/// Custom error handler that logs the actual connection error
#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("postgres connection pool error: {:?}", err);
    }
}

#[derive(Debug, Clone)]
pub struct WarehouseSettings {
    pub db_url: String,
    pub schema: Option<String>,
    pub pool_size: u32,
    pub allow_invalid_certs: bool,
    pub embedding_dimensions: u32,
}

impl WarehouseSettings {
    pub fn from_env() -> Result<Self, WarehouseError> {
        Ok(Self {
            db_url: resolve_db_url()?,
            schema: env::var("WAREHOUSE_SCHEMA")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            pool_size: resolve_u32_env("WAREHOUSE_POOL_SIZE", 8),
            allow_invalid_certs: resolve_bool_env("WAREHOUSE_TLS_ALLOW_INVALID_CERTS"),
            embedding_dimensions: resolve_u32_env("EMBEDDING_DIMENSIONS", 1536),
        })
    }
}

type PgPool = Pool<PostgresConnectionManager<MakeTlsConnector>>;

const EMAIL_COLUMNS: &str = "id, user_id, from_address, subject, body, \"timestamp\", message_id, \
     thread_id, \"references\", body_blob_uri, attachment_blob_uris";

const ATTACHMENT_COLUMNS: &str = "email_id, file_name, blob_uri, content_type, size, uploaded_at, \
     attachment_ref, extracted_content";

/// Postgres + pgvector warehouse.
#[derive(Clone)]
pub struct PostgresWarehouse {
    pool: Option<PgPool>,
    schema: Option<String>,
    dimensions: u32,
}

impl PostgresWarehouse {
    pub fn from_env() -> Result<Self, WarehouseError> {
        Self::new(&WarehouseSettings::from_env()?)
    }

    pub fn new(settings: &WarehouseSettings) -> Result<Self, WarehouseError> {
        let schema = match settings.schema.as_deref() {
            Some(raw) => Some(sanitize_identifier(raw)?),
            None => None,
        };

        let config: postgres::Config = settings.db_url.parse().map_err(WarehouseError::Postgres)?;
        let mut tls_builder = native_tls::TlsConnector::builder();
        if settings.allow_invalid_certs {
            tls_builder.danger_accept_invalid_certs(true);
            tls_builder.danger_accept_invalid_hostnames(true);
        }
        let tls_connector = tls_builder
            .build()
            .map_err(|err| WarehouseError::Config(err.to_string()))?;
        let tls = MakeTlsConnector::new(tls_connector);

        let manager = PostgresConnectionManager::new(config, tls);
        let pool = Pool::builder()
            .max_size(settings.pool_size.max(1))
            .idle_timeout(Some(Duration::from_secs(300)))
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;

        Ok(Self {
            pool: Some(pool),
            schema,
            dimensions: settings.embedding_dimensions.max(1),
        })
    }

    fn connection(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<MakeTlsConnector>>, WarehouseError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| WarehouseError::Unavailable("warehouse pool closed".to_string()))?;
        Ok(pool.get()?)
    }

    fn table(&self, name: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, name),
            None => name.to_string(),
        }
    }

    fn table_exists(
        &self,
        conn: &mut postgres::Client,
        name: &str,
    ) -> Result<bool, WarehouseError> {
        let row = conn.query_one(
            "SELECT to_regclass($1::text) IS NOT NULL",
            &[&self.table(name)],
        )?;
        Ok(row.get(0))
    }

    fn schema_ddl(&self, name: &str) -> String {
        match name {
            "emails" => format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    from_address TEXT NOT NULL,
                    subject TEXT NOT NULL,
                    body TEXT NOT NULL,
                    \"timestamp\" TIMESTAMPTZ NOT NULL,
                    message_id TEXT,
                    thread_id TEXT,
                    \"references\" TEXT[] NOT NULL DEFAULT '{{}}',
                    body_blob_uri TEXT NOT NULL,
                    attachment_blob_uris TEXT[] NOT NULL DEFAULT '{{}}',
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE INDEX IF NOT EXISTS {name}_user_timestamp_idx ON {table}(user_id, \"timestamp\" DESC);
                CREATE INDEX IF NOT EXISTS {name}_user_from_idx ON {table}(user_id, lower(from_address));",
                table = self.table(name),
                name = name,
            ),
            "email_attachments" => format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    email_id UUID NOT NULL,
                    file_name TEXT NOT NULL,
                    blob_uri TEXT NOT NULL,
                    content_type TEXT NOT NULL,
                    size BIGINT NOT NULL,
                    uploaded_at TIMESTAMPTZ NOT NULL,
                    attachment_ref TEXT NOT NULL,
                    extracted_content TEXT NOT NULL,
                    UNIQUE (email_id, attachment_ref)
                );",
                table = self.table(name),
            ),
            "email_embeddings" => format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id BIGSERIAL PRIMARY KEY,
                    email_id UUID NOT NULL,
                    body TEXT NOT NULL,
                    embedding vector({dimensions}),
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE INDEX IF NOT EXISTS {name}_email_idx ON {table}(email_id);",
                table = self.table(name),
                name = name,
                dimensions = self.dimensions,
            ),
            "email_replies" => format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    original_email_id UUID NOT NULL,
                    reply_subject TEXT NOT NULL,
                    reply_body TEXT NOT NULL,
                    \"timestamp\" TIMESTAMPTZ NOT NULL,
                    sent_success BOOLEAN NOT NULL
                );",
                table = self.table(name),
            ),
            _ => format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    character_id TEXT PRIMARY KEY,
                    greeting TEXT,
                    signature TEXT,
                    company TEXT,
                    agent_name TEXT,
                    position TEXT,
                    email TEXT,
                    template TEXT,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );",
                table = self.table(name),
            ),
        }
    }

    /// Drops every pipeline table, and the schema when one is configured.
    pub fn drop_tables(&self) -> Result<(), WarehouseError> {
        let mut conn = self.connection()?;
        for name in TABLES {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", self.table(name)), &[])?;
        }
        if let Some(schema) = &self.schema {
            conn.execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema), &[])?;
        }
        Ok(())
    }
}

const TABLES: [&str; 5] = [
    "emails",
    "email_attachments",
    "email_embeddings",
    "email_replies",
    "reply_templates",
];

impl Warehouse for PostgresWarehouse {
    fn ensure_schema(&self) -> Result<(), WarehouseError> {
        let mut conn = self.connection()?;

        let has_vector: bool = conn
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'vector')",
                &[],
            )?
            .get(0);
        if !has_vector {
            info!("creating pgvector extension");
            conn.batch_execute("CREATE EXTENSION IF NOT EXISTS vector")?;
        }

        if let Some(schema) = &self.schema {
            let has_schema: bool = conn
                .query_one(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
                    &[schema],
                )?
                .get(0);
            if !has_schema {
                conn.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))?;
            }
        }

        for name in TABLES {
            if self.table_exists(&mut conn, name)? {
                continue;
            }
            info!("creating warehouse table {}", self.table(name));
            conn.batch_execute(&self.schema_ddl(name))?;
        }
        Ok(())
    }

    fn email_exists(&self, id: &Uuid) -> Result<bool, WarehouseError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            &format!(
                "SELECT EXISTS (SELECT 1 FROM {table} WHERE id = $1)",
                table = self.table("emails")
            ),
            &[id],
        )?;
        Ok(row.get(0))
    }

    fn insert_email(&self, record: &EmailRecord) -> Result<bool, WarehouseError> {
        let mut conn = self.connection()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO {table} ({columns})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (id) DO NOTHING",
                table = self.table("emails"),
                columns = EMAIL_COLUMNS
            ),
            &[
                &record.id,
                &record.user_id,
                &record.from_address,
                &record.subject,
                &record.body_text,
                &record.timestamp,
                &record.provider_message_id,
                &record.thread_id,
                &record.references,
                &record.body_blob_uri,
                &record.attachment_blob_uris,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn get_email(&self, user_id: &str, id: &Uuid) -> Result<Option<EmailRecord>, WarehouseError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {columns} FROM {table} WHERE user_id = $1 AND id = $2",
                table = self.table("emails"),
                columns = EMAIL_COLUMNS
            ),
            &[&user_id, id],
        )?;
        Ok(row.as_ref().map(email_from_row))
    }

    fn list_recent(
        &self,
        user_id: &str,
        limit: usize,
        exclude: Option<&Uuid>,
    ) -> Result<Vec<EmailRecord>, WarehouseError> {
        let mut conn = self.connection()?;
        let exclude = exclude.copied();
        let rows = conn.query(
            &format!(
                "SELECT {columns} FROM {table}
                 WHERE user_id = $1 AND ($2::uuid IS NULL OR id <> $2)
                 ORDER BY \"timestamp\" DESC
                 LIMIT $3",
                table = self.table("emails"),
                columns = EMAIL_COLUMNS
            ),
            &[&user_id, &exclude, &(limit as i64)],
        )?;
        Ok(rows.iter().map(email_from_row).collect())
    }

    fn find_by_address(
        &self,
        user_id: &str,
        address: &str,
        limit: usize,
    ) -> Result<Vec<EmailRecord>, WarehouseError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {columns} FROM {table}
                 WHERE user_id = $1 AND lower(from_address) = lower($2)
                 ORDER BY \"timestamp\" DESC
                 LIMIT $3",
                table = self.table("emails"),
                columns = EMAIL_COLUMNS
            ),
            &[&user_id, &address, &(limit as i64)],
        )?;
        Ok(rows.iter().map(email_from_row).collect())
    }

    fn search_body(
        &self,
        user_id: &str,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<EmailRecord>, WarehouseError> {
        let mut conn = self.connection()?;
        let pattern = format!("%{}%", escape_like(needle));
        let rows = conn.query(
            &format!(
                "SELECT {columns} FROM {table}
                 WHERE user_id = $1 AND body ILIKE $2 ESCAPE '\\'
                 ORDER BY \"timestamp\" DESC
                 LIMIT $3",
                table = self.table("emails"),
                columns = EMAIL_COLUMNS
            ),
            &[&user_id, &pattern, &(limit as i64)],
        )?;
        Ok(rows.iter().map(email_from_row).collect())
    }

    fn new_email_counts_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(String, i64)>, WarehouseError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT user_id, COUNT(*) FROM {table}
                 WHERE created_at > $1 AND created_at <= $2
                 GROUP BY user_id
                 ORDER BY user_id",
                table = self.table("emails")
            ),
            &[&since, &until],
        )?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, i64>(1)))
            .collect())
    }

    fn find_attachment(
        &self,
        email_id: &Uuid,
        attachment_ref: &str,
    ) -> Result<Option<AttachmentRecord>, WarehouseError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT {columns} FROM {table} WHERE email_id = $1 AND attachment_ref = $2",
                table = self.table("email_attachments"),
                columns = ATTACHMENT_COLUMNS
            ),
            &[email_id, &attachment_ref],
        )?;
        Ok(row.as_ref().map(attachment_from_row))
    }

    fn insert_attachment(&self, record: &AttachmentRecord) -> Result<bool, WarehouseError> {
        let mut conn = self.connection()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO {table} ({columns})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (email_id, attachment_ref) DO NOTHING",
                table = self.table("email_attachments"),
                columns = ATTACHMENT_COLUMNS
            ),
            &[
                &record.email_id,
                &record.file_name,
                &record.blob_uri,
                &record.content_type,
                &record.size,
                &record.uploaded_at,
                &record.attachment_ref,
                &record.extracted_text,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn attachment_records(
        &self,
        user_id: &str,
        email_id: &Uuid,
    ) -> Result<Vec<AttachmentRecord>, WarehouseError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            &format!(
                "SELECT {columns} FROM {table}
                 WHERE email_id = $1
                   AND EXISTS (SELECT 1 FROM {emails} e WHERE e.id = $1 AND e.user_id = $2)
                 ORDER BY uploaded_at, file_name",
                table = self.table("email_attachments"),
                emails = self.table("emails"),
                columns = ATTACHMENT_COLUMNS
            ),
            &[email_id, &user_id],
        )?;
        Ok(rows.iter().map(attachment_from_row).collect())
    }

    fn insert_embedding(&self, record: &EmbeddingRecord) -> Result<(), WarehouseError> {
        let mut conn = self.connection()?;
        conn.execute(
            &format!(
                "INSERT INTO {table} (email_id, body, embedding, created_at)
                 VALUES ($1, $2, $3::text::vector, $4)",
                table = self.table("email_embeddings")
            ),
            &[
                &record.email_id,
                &record.body_text,
                &vector_to_pg(&record.vector),
                &record.created_at,
            ],
        )?;
        Ok(())
    }

    fn embedding_for(
        &self,
        user_id: &str,
        email_id: &Uuid,
    ) -> Result<Option<Vec<f32>>, WarehouseError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT emb.embedding::text
                 FROM {embeddings} emb
                 JOIN {emails} e ON e.id = emb.email_id
                 WHERE e.user_id = $1 AND emb.email_id = $2 AND emb.embedding IS NOT NULL
                 ORDER BY emb.created_at DESC
                 LIMIT 1",
                embeddings = self.table("email_embeddings"),
                emails = self.table("emails")
            ),
            &[&user_id, email_id],
        )?;
        match row {
            Some(row) => {
                let literal: String = row.get(0);
                Ok(Some(vector_from_pg(&literal)?))
            }
            None => Ok(None),
        }
    }

    fn count_embeddings(&self) -> Result<i64, WarehouseError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            &format!(
                "SELECT COUNT(*) FROM {table} WHERE embedding IS NOT NULL",
                table = self.table("email_embeddings")
            ),
            &[],
        )?;
        Ok(row.get(0))
    }

    fn vector_index_exists(&self) -> Result<bool, WarehouseError> {
        let mut conn = self.connection()?;
        let row = conn.query_one(
            "SELECT EXISTS (
                SELECT 1 FROM pg_indexes
                WHERE schemaname = COALESCE($1::text, current_schema())
                  AND indexname = $2
            )",
            &[&self.schema, &VECTOR_INDEX_NAME],
        )?;
        Ok(row.get(0))
    }

    fn create_vector_index(&self, lists: u32) -> Result<(), WarehouseError> {
        let mut conn = self.connection()?;
        conn.batch_execute(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table}
             USING ivfflat (embedding vector_cosine_ops) WITH (lists = {lists})",
            index = VECTOR_INDEX_NAME,
            table = self.table("email_embeddings"),
            lists = lists.max(1)
        ))?;
        Ok(())
    }

    fn nearest_neighbors(
        &self,
        user_id: &str,
        query: &[f32],
        exclude: Option<&Uuid>,
        limit: usize,
    ) -> Result<Vec<Neighbor>, WarehouseError> {
        let mut conn = self.connection()?;
        let exclude = exclude.copied();
        let columns = EMAIL_COLUMNS
            .split(", ")
            .map(|column| format!("e.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = conn.query(
            &format!(
                "SELECT {columns}, (emb.embedding <=> $2::text::vector)::float8 AS distance
                 FROM {embeddings} emb
                 JOIN {emails} e ON e.id = emb.email_id
                 WHERE e.user_id = $1
                   AND emb.embedding IS NOT NULL
                   AND ($3::uuid IS NULL OR e.id <> $3)
                 ORDER BY emb.embedding <=> $2::text::vector ASC
                 LIMIT $4",
                columns = columns,
                embeddings = self.table("email_embeddings"),
                emails = self.table("emails")
            ),
            &[&user_id, &vector_to_pg(query), &exclude, &(limit as i64)],
        )?;
        Ok(rows
            .iter()
            .map(|row| Neighbor {
                email: email_from_row(row),
                distance: row.get::<_, f64>("distance"),
            })
            .collect())
    }

    fn insert_reply(&self, record: &ReplyRecord) -> Result<(), WarehouseError> {
        let mut conn = self.connection()?;
        conn.execute(
            &format!(
                "INSERT INTO {table}
                    (id, original_email_id, reply_subject, reply_body, \"timestamp\", sent_success)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO NOTHING",
                table = self.table("email_replies")
            ),
            &[
                &record.id,
                &record.original_email_id,
                &record.reply_subject,
                &record.reply_body,
                &record.timestamp,
                &record.sent_success,
            ],
        )?;
        Ok(())
    }

    fn reply_template(&self, character_id: &str) -> Result<Option<ReplyTemplate>, WarehouseError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!(
                "SELECT greeting, signature, company, agent_name, position, email, template
                 FROM {table} WHERE character_id = $1",
                table = self.table("reply_templates")
            ),
            &[&character_id],
        )?;
        Ok(row.map(|row| ReplyTemplate {
            greeting: row.get(0),
            signature: row.get(1),
            company: row.get(2),
            agent_name: row.get(3),
            position: row.get(4),
            email: row.get(5),
            template: row.get(6),
        }))
    }
}

impl Drop for PostgresWarehouse {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            std::thread::spawn(move || drop(pool));
        }
    }
}

fn email_from_row(row: &Row) -> EmailRecord {
    EmailRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        from_address: row.get("from_address"),
        subject: row.get("subject"),
        body_text: row.get("body"),
        timestamp: row.get("timestamp"),
        provider_message_id: row.get("message_id"),
        thread_id: row.get("thread_id"),
        references: row.get("references"),
        body_blob_uri: row.get("body_blob_uri"),
        attachment_blob_uris: row.get("attachment_blob_uris"),
    }
}

fn attachment_from_row(row: &Row) -> AttachmentRecord {
    AttachmentRecord {
        email_id: row.get("email_id"),
        file_name: row.get("file_name"),
        blob_uri: row.get("blob_uri"),
        content_type: row.get("content_type"),
        size: row.get("size"),
        uploaded_at: row.get("uploaded_at"),
        attachment_ref: row.get("attachment_ref"),
        extracted_text: row.get("extracted_content"),
    }
}

/// pgvector text literal, e.g. `[0.1,0.2]`.
pub(crate) fn vector_to_pg(values: &[f32]) -> String {
    let parts: Vec<String> = values.iter().map(|value| value.to_string()).collect();
    format!("[{}]", parts.join(","))
}

pub(crate) fn vector_from_pg(literal: &str) -> Result<Vec<f32>, WarehouseError> {
    let inner = literal
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| WarehouseError::InvalidVector(literal.to_string()))?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|_| WarehouseError::InvalidVector(literal.to_string()))
        })
        .collect()
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn resolve_db_url() -> Result<String, WarehouseError> {
    env::var("WAREHOUSE_DB_URL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| {
            env::var("DATABASE_URL")
                .ok()
                .filter(|value| !value.trim().is_empty())
        })
        .ok_or(WarehouseError::MissingDbUrl)
}

fn sanitize_identifier(raw: &str) -> Result<String, WarehouseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        || trimmed.chars().next().is_some_and(|ch| ch.is_ascii_digit())
    {
        return Err(WarehouseError::InvalidSchemaName(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

fn resolve_u32_env(key: &str, default_value: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_value)
}

fn resolve_bool_env(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
