//! Capability probes run by `nsdb-check`.
//!
//! Each probe is one self-contained statement. A failing probe is recorded and
//! the session is reset with `ROLLBACK` before the next one, so one failure
//! never poisons the probes after it. Probes cast their output columns to
//! text so every result decodes the same way.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::postgres::PgConnection;
use sqlx::Row;

/// Rows as text cells; `None` is SQL NULL.
pub type Rows = Vec<Vec<Option<String>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Report key, e.g. `postgis.version_fn`.
    pub key: &'static str,
    /// Human-readable name for the log.
    pub name: &'static str,
    pub sql: &'static str,
    /// An empty result counts as a failure.
    pub expect_rows: bool,
}

impl Probe {
    const fn new(key: &'static str, name: &'static str, sql: &'static str) -> Self {
        Self {
            key,
            name,
            sql,
            expect_rows: false,
        }
    }

    const fn expecting_rows(mut self) -> Self {
        self.expect_rows = true;
        self
    }
}

/// Probes in run order. `enable_extensions` adds the `CREATE EXTENSION` steps.
pub fn standard_probes(enable_extensions: bool) -> Vec<Probe> {
    let mut probes = vec![
        Probe::new("env.server_version", "server_version", "SHOW server_version"),
        Probe::new("env.current_database", "current database", "SELECT current_database()::text"),
        Probe::new(
            "tsvector.type_exists",
            "tsvector type exists",
            "SELECT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'tsvector')::text AS has_tsvector",
        ),
        Probe::new(
            "tsvector.to_tsvector",
            "to_tsvector works",
            "SELECT to_tsvector('english', 'hello world')::text AS tv",
        ),
    ];

    if enable_extensions {
        probes.push(Probe::new("pgvector.enable", "enable vector", "CREATE EXTENSION IF NOT EXISTS vector"));
    }
    probes.extend([
        Probe::new(
            "pgvector.installed",
            "vector extension installed",
            "SELECT extname::text, extversion::text, extnamespace::regnamespace::text \
             FROM pg_extension WHERE extname = 'vector'",
        )
        .expecting_rows(),
        Probe::new(
            "pgvector.type_present",
            "vector type present",
            "SELECT n.nspname::text, t.typname::text \
             FROM pg_type t JOIN pg_namespace n ON n.oid = t.typnamespace \
             WHERE t.typname = 'vector'",
        )
        .expecting_rows(),
        Probe::new(
            "pgvector.distance_op",
            "vector type & <-> distance operator",
            "CREATE TEMP TABLE IF NOT EXISTS _nsdb_vec_probe (v vector(3)); \
             TRUNCATE _nsdb_vec_probe; \
             INSERT INTO _nsdb_vec_probe (v) VALUES ('[1,2,3]'), ('[3,2,1]'); \
             SELECT (v <-> '[0,0,0]'::vector)::text AS l2 FROM _nsdb_vec_probe ORDER BY 1 LIMIT 1",
        )
        .expecting_rows(),
    ]);

    if enable_extensions {
        probes.push(Probe::new("postgis.enable", "enable postgis", "CREATE EXTENSION IF NOT EXISTS postgis"));
    }
    probes.extend([
        Probe::new(
            "postgis.installed",
            "postgis extension installed",
            "SELECT extname::text, extversion::text, extnamespace::regnamespace::text \
             FROM pg_extension WHERE extname = 'postgis'",
        )
        .expecting_rows(),
        Probe::new(
            "postgis.version_fn",
            "PostGIS_Full_Version() works",
            "SELECT PostGIS_Full_Version()::text",
        ),
        Probe::new(
            "postgis.geometry_ops",
            "geometry operations (ST_Buffer)",
            "SELECT ST_AsText(ST_Buffer(ST_GeomFromText('POINT(0 0)', 4326), 1.0))",
        ),
    ]);

    probes
}

/// Probe state: not run, then exactly one of passed or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    NotRun,
    /// First row of the result, if any.
    Passed { result: Option<Vec<Option<String>>> },
    Failed { error: String },
}

impl ProbeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }

    fn to_json(&self) -> Value {
        match self {
            Self::NotRun => json!({ "ok": false, "status": "not_run" }),
            Self::Passed { result } => {
                let rows: Vec<&Vec<Option<String>>> = result.iter().collect();
                json!({ "ok": true, "result": rows })
            }
            Self::Failed { error } => json!({ "ok": false, "error": error }),
        }
    }
}

/// Outcomes keyed by probe, in run order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    entries: Vec<(&'static str, ProbeOutcome)>,
}

impl ProbeReport {
    /// Every probe starts out not run.
    pub fn pending(probes: &[Probe]) -> Self {
        Self {
            entries: probes.iter().map(|p| (p.key, ProbeOutcome::NotRun)).collect(),
        }
    }

    pub fn record(&mut self, key: &'static str, outcome: ProbeOutcome) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = outcome,
            None => self.entries.push((key, outcome)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ProbeOutcome> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, o)| o)
    }

    pub fn passed(&self) -> usize {
        self.entries.iter().filter(|(_, o)| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, o)| matches!(o, ProbeOutcome::Failed { .. }))
            .count()
    }

    /// `{ "<key>": {"ok": true, "result": [...]} | {"ok": false, "error": "..."} }`
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, o)| (k.to_string(), o.to_json()))
            .collect();
        Value::Object(map)
    }
}

/// Where probes run. Implemented for a live connection and, in tests, for scripted sessions.
#[async_trait]
pub trait ProbeExecutor: Send {
    async fn query(&mut self, sql: &str) -> Result<Rows, String>;

    /// Clear any aborted transaction state.
    async fn reset(&mut self) -> Result<(), String>;
}

#[async_trait]
impl ProbeExecutor for PgConnection {
    async fn query(&mut self, sql: &str) -> Result<Rows, String> {
        // A plain &str runs over the simple-query protocol, so multi-statement probes work.
        let rows = sqlx::Executor::fetch_all(&mut *self, sql)
            .await
            .map_err(|e| e.to_string())?;

        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<Option<String>, _>(i).map_err(|e| e.to_string()))
                    .collect()
            })
            .collect()
    }

    async fn reset(&mut self) -> Result<(), String> {
        sqlx::Executor::execute(&mut *self, "ROLLBACK")
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Run every probe in order. Never fails: errors end up in the report.
pub async fn run_probes<E>(executor: &mut E, probes: &[Probe]) -> ProbeReport
where
    E: ProbeExecutor + ?Sized,
{
    let mut report = ProbeReport::pending(probes);

    for probe in probes {
        let outcome = match executor.query(probe.sql).await {
            Ok(rows) if probe.expect_rows && rows.is_empty() => ProbeOutcome::Failed {
                error: "no rows returned".to_string(),
            },
            Ok(rows) => ProbeOutcome::Passed {
                result: rows.into_iter().next(),
            },
            Err(error) => {
                if let Err(reset_err) = executor.reset().await {
                    tracing::warn!(probe = probe.key, error = %reset_err, "ROLLBACK after failed probe failed");
                }
                ProbeOutcome::Failed { error }
            }
        };

        match &outcome {
            ProbeOutcome::Passed { result } => {
                tracing::info!(probe = probe.key, result = ?result, "{}: OK", probe.name)
            }
            ProbeOutcome::Failed { error } => {
                tracing::warn!(probe = probe.key, error = %error, "{}: FAILED", probe.name)
            }
            ProbeOutcome::NotRun => {}
        }
        report.record(probe.key, outcome);
    }

    tracing::info!(passed = report.passed(), failed = report.failed(), "Probes finished");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Behaves like a session whose transaction aborts on error until ROLLBACK.
    #[derive(Default)]
    struct ScriptedSession {
        responses: HashMap<&'static str, Result<Rows, String>>,
        aborted: bool,
        resets: usize,
    }

    impl ScriptedSession {
        fn respond(mut self, sql: &'static str, response: Result<Rows, String>) -> Self {
            self.responses.insert(sql, response);
            self
        }
    }

    #[async_trait]
    impl ProbeExecutor for ScriptedSession {
        async fn query(&mut self, sql: &str) -> Result<Rows, String> {
            if self.aborted {
                return Err("current transaction is aborted, commands ignored until end of transaction block".into());
            }
            let response = self.responses.get(sql).cloned().unwrap_or(Ok(vec![]));
            if response.is_err() {
                self.aborted = true;
            }
            response
        }

        async fn reset(&mut self) -> Result<(), String> {
            self.aborted = false;
            self.resets += 1;
            Ok(())
        }
    }

    fn cell(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    fn probe(key: &'static str, sql: &'static str) -> Probe {
        Probe::new(key, key, sql)
    }

    #[tokio::test]
    async fn failure_does_not_affect_later_probes() {
        let probes = vec![
            probe("a", "SELECT 1"),
            probe("b", "SELECT broken"),
            probe("c", "SELECT 3"),
        ];
        let mut session = ScriptedSession::default()
            .respond("SELECT 1", Ok(vec![vec![cell("1")]]))
            .respond("SELECT broken", Err("column \"broken\" does not exist".into()))
            .respond("SELECT 3", Ok(vec![vec![cell("3")]]));

        let report = run_probes(&mut session, &probes).await;

        assert_eq!(session.resets, 1);
        assert_eq!(report.passed(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(
            report.get("c"),
            Some(&ProbeOutcome::Passed {
                result: Some(vec![cell("3")])
            })
        );
        assert!(matches!(report.get("b"), Some(ProbeOutcome::Failed { error }) if error.contains("broken")));
    }

    #[tokio::test]
    async fn expected_rows_missing_is_a_failure() {
        let probes = vec![probe("ext", "SELECT ext").expecting_rows(), probe("ddl", "CREATE x")];
        let mut session = ScriptedSession::default();

        let report = run_probes(&mut session, &probes).await;
        assert!(matches!(report.get("ext"), Some(ProbeOutcome::Failed { .. })));
        // Statements without result rows still pass.
        assert_eq!(report.get("ddl"), Some(&ProbeOutcome::Passed { result: None }));
        assert_eq!(session.resets, 0);
    }

    #[tokio::test]
    async fn report_json_is_keyed_in_run_order() {
        let probes = standard_probes(false);
        let mut session = ScriptedSession::default()
            .respond("SHOW server_version", Ok(vec![vec![cell("16.2")]]))
            .respond("SELECT PostGIS_Full_Version()::text", Err("function does not exist".into()));

        let report = run_probes(&mut session, &probes).await;
        let json = report.to_json();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();

        assert_eq!(keys.first().map(|k| k.as_str()), Some("env.server_version"));
        assert_eq!(keys.len(), probes.len());
        assert_eq!(json["env.server_version"], json!({ "ok": true, "result": [["16.2"]] }));
        assert_eq!(json["postgis.version_fn"]["ok"], json!(false));
        assert_eq!(json["postgis.geometry_ops"], json!({ "ok": true, "result": [] }));
    }

    #[test]
    fn extension_creation_is_opt_in() {
        let read_only: Vec<&str> = standard_probes(false).iter().map(|p| p.key).collect();
        assert!(!read_only.iter().any(|k| k.ends_with(".enable")));

        let enabling: Vec<&str> = standard_probes(true).iter().map(|p| p.key).collect();
        assert_eq!(
            enabling,
            vec![
                "env.server_version",
                "env.current_database",
                "tsvector.type_exists",
                "tsvector.to_tsvector",
                "pgvector.enable",
                "pgvector.installed",
                "pgvector.type_present",
                "pgvector.distance_op",
                "postgis.enable",
                "postgis.installed",
                "postgis.version_fn",
                "postgis.geometry_ops",
            ]
        );
    }

    #[test]
    fn pending_report_marks_every_probe_not_run() {
        let report = ProbeReport::pending(&standard_probes(false));
        assert_eq!(report.passed(), 0);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.to_json()["env.server_version"]["status"], "not_run");
    }
}
