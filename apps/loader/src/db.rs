//! Connection setup and schema-level statements.

use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use url::Url;

use crate::ident::Ident;
use crate::{Error, Result};

/// Extensions the loaded relations depend on.
pub const REQUIRED_EXTENSIONS: [&str; 3] = ["postgis", "pg_trgm", "unaccent"];

/// Add `sslmode=require` unless the caller already chose an `sslmode`.
pub fn ensure_sslmode_required(database_url: &str) -> Result<String> {
    let mut url = Url::parse(database_url)
        .map_err(|e| Error::Config(format!("invalid database url: {e}")))?;

    if url.query_pairs().any(|(k, _)| k == "sslmode") {
        return Ok(url.into());
    }
    url.query_pairs_mut().append_pair("sslmode", "require");
    Ok(url.into())
}

/// Single-connection pool. Stages acquire the connection in turn, so there is
/// never more than one writer. `search_path` is set to the target schema on connect.
pub async fn create_pool(database_url: &str, schema: Option<&Ident>) -> Result<PgPool> {
    tracing::info!("Creating database connection pool...");

    let search_path = schema.map(|s| format!("SET search_path TO {s}, public"));

    let pool = PgPoolOptions::new()
        .min_connections(0)
        .max_connections(1)
        .after_connect(move |conn, _meta| {
            let search_path = search_path.clone();
            Box::pin(async move {
                if let Some(sql) = search_path {
                    sqlx::Executor::execute(&mut *conn, sql.as_str()).await?;
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    tracing::info!("Database pool created (max: 1)");
    Ok(pool)
}

/// Run one statement that takes no parameters (DDL, ANALYZE, ...).
pub async fn exec(conn: &mut PgConnection, sql: &str) -> Result<()> {
    tracing::trace!(sql, "exec");
    sqlx::raw_sql(sql).execute(conn).await?;
    Ok(())
}

pub async fn ensure_schema(conn: &mut PgConnection, schema: &Ident) -> Result<()> {
    exec(conn, &format!("CREATE SCHEMA IF NOT EXISTS {schema}")).await?;
    exec(conn, &format!("SET search_path TO {schema}, public")).await?;
    Ok(())
}

pub async fn ensure_extensions(conn: &mut PgConnection) -> Result<()> {
    for ext in REQUIRED_EXTENSIONS {
        exec(conn, &format!("CREATE EXTENSION IF NOT EXISTS {ext}")).await?;
        tracing::debug!(extension = ext, "Extension available");
    }
    Ok(())
}

/// Basic facts about the server, logged at startup.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub version: String,
    pub database: String,
    pub schema: Option<String>,
}

pub async fn server_info(conn: &mut PgConnection) -> Result<ServerInfo> {
    let version: String = sqlx::query_scalar("SELECT version()")
        .fetch_one(&mut *conn)
        .await?;
    let database: String = sqlx::query_scalar("SELECT current_database()::text")
        .fetch_one(&mut *conn)
        .await?;
    let schema: Option<String> = sqlx::query_scalar("SELECT current_schema()::text")
        .fetch_one(&mut *conn)
        .await?;

    Ok(ServerInfo {
        version: version.lines().next().unwrap_or_default().to_string(),
        database,
        schema,
    })
}

/// Names of all indexes on a relation, sorted.
pub async fn index_names(conn: &mut PgConnection, schema: &Ident, table: &Ident) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT indexname::text FROM pg_indexes WHERE schemaname = $1 AND tablename = $2 ORDER BY indexname",
    )
    .bind(schema.as_str())
    .bind(table.as_str())
    .fetch_all(conn)
    .await?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_sslmode_when_absent() {
        let url = ensure_sslmode_required("postgres://user:pw@db.example.com:5432/ns").unwrap();
        assert_eq!(url, "postgres://user:pw@db.example.com:5432/ns?sslmode=require");
    }

    #[test]
    fn keeps_other_query_parameters() {
        let url = ensure_sslmode_required("postgres://h/db?application_name=nsdb").unwrap();
        assert_eq!(url, "postgres://h/db?application_name=nsdb&sslmode=require");
    }

    #[test]
    fn respects_caller_sslmode() {
        let url = ensure_sslmode_required("postgres://h/db?sslmode=disable").unwrap();
        assert_eq!(url, "postgres://h/db?sslmode=disable");
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(matches!(
            ensure_sslmode_required("not a url"),
            Err(Error::Config(_))
        ));
    }
}
