pub mod pricing;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create ledger parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
}

fn sql_error(source: rusqlite::Error) -> LedgerError {
    LedgerError::Sql { source }
}

/// One cost-accounting row per completed provider request. The primary key
/// is the logical identity of the step, so duplicate recording is a no-op by
/// construction rather than a detection problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Receipt {
    pub run_id: String,
    pub step_key: String,
    pub recorded_at: i64,
    pub project: String,
    pub model: String,
    pub mode: String,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_cost: f64,
    pub storage_cost: f64,
    pub total_cost: f64,
    pub cost_estimated: bool,
    pub prompt_digest: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiptQuery {
    pub run_id: Option<String>,
    pub response_id: Option<String>,
    pub batch_id: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub project: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub digest_contains: Option<String>,
    pub limit: Option<u32>,
}

pub struct ReceiptLedger {
    db_path: PathBuf,
}

impl ReceiptLedger {
    pub fn open(db_path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| LedgerError::CreateParent {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }
        let ledger = Self {
            db_path: db_path.to_path_buf(),
        };
        let connection = ledger.connect()?;
        ledger.ensure_schema(&connection)?;
        Ok(ledger)
    }

    fn connect(&self) -> Result<Connection, LedgerError> {
        let connection = Connection::open(&self.db_path).map_err(|source| LedgerError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .busy_timeout(Duration::from_secs(10))
            .map_err(sql_error)?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_error)?;
        connection
            .pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_error)?;
        Ok(connection)
    }

    fn ensure_schema(&self, connection: &Connection) -> Result<(), LedgerError> {
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS receipts (
                    run_id TEXT NOT NULL,
                    step_key TEXT NOT NULL,
                    recorded_at INTEGER NOT NULL,
                    project TEXT NOT NULL,
                    model TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    response_id TEXT,
                    batch_id TEXT,
                    input_tokens INTEGER NOT NULL,
                    output_tokens INTEGER NOT NULL,
                    tool_cost REAL NOT NULL,
                    storage_cost REAL NOT NULL,
                    total_cost REAL NOT NULL,
                    cost_estimated INTEGER NOT NULL,
                    prompt_digest TEXT NOT NULL,
                    PRIMARY KEY (run_id, step_key)
                );

                CREATE INDEX IF NOT EXISTS idx_receipts_run_id
                    ON receipts(run_id);
                CREATE INDEX IF NOT EXISTS idx_receipts_response_id
                    ON receipts(response_id);
                CREATE INDEX IF NOT EXISTS idx_receipts_batch_id
                    ON receipts(batch_id);
                CREATE INDEX IF NOT EXISTS idx_receipts_recorded_at
                    ON receipts(recorded_at);
                ",
            )
            .map_err(sql_error)
    }

    /// Idempotent insert. Returns `true` when the receipt was new, `false`
    /// when the `(run_id, step_key)` key already existed.
    pub fn record(&self, receipt: &Receipt) -> Result<bool, LedgerError> {
        let connection = self.connect()?;
        let inserted = connection
            .execute(
                "INSERT OR IGNORE INTO receipts
                 (run_id, step_key, recorded_at, project, model, mode, response_id, batch_id,
                  input_tokens, output_tokens, tool_cost, storage_cost, total_cost,
                  cost_estimated, prompt_digest)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    receipt.run_id,
                    receipt.step_key,
                    receipt.recorded_at,
                    receipt.project,
                    receipt.model,
                    receipt.mode,
                    receipt.response_id,
                    receipt.batch_id,
                    receipt.input_tokens as i64,
                    receipt.output_tokens as i64,
                    receipt.tool_cost,
                    receipt.storage_cost,
                    receipt.total_cost,
                    receipt.cost_estimated as i64,
                    receipt.prompt_digest,
                ],
            )
            .map_err(sql_error)?;
        Ok(inserted > 0)
    }

    pub fn query(&self, filter: &ReceiptQuery) -> Result<Vec<Receipt>, LedgerError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        let mut push = |clause: &'static str, value: rusqlite::types::Value, clauses: &mut Vec<&str>, values: &mut Vec<rusqlite::types::Value>| {
            clauses.push(clause);
            values.push(value);
        };

        if let Some(run_id) = &filter.run_id {
            push("run_id = ?", run_id.clone().into(), &mut clauses, &mut values);
        }
        if let Some(response_id) = &filter.response_id {
            push("response_id = ?", response_id.clone().into(), &mut clauses, &mut values);
        }
        if let Some(batch_id) = &filter.batch_id {
            push("batch_id = ?", batch_id.clone().into(), &mut clauses, &mut values);
        }
        if let Some(model) = &filter.model {
            push("model = ?", model.clone().into(), &mut clauses, &mut values);
        }
        if let Some(mode) = &filter.mode {
            push("mode = ?", mode.clone().into(), &mut clauses, &mut values);
        }
        if let Some(project) = &filter.project {
            push("project = ?", project.clone().into(), &mut clauses, &mut values);
        }
        if let Some(since) = filter.since {
            push("recorded_at >= ?", since.into(), &mut clauses, &mut values);
        }
        if let Some(until) = filter.until {
            push("recorded_at <= ?", until.into(), &mut clauses, &mut values);
        }
        if let Some(digest) = &filter.digest_contains {
            push(
                "prompt_digest LIKE '%' || ? || '%'",
                digest.clone().into(),
                &mut clauses,
                &mut values,
            );
        }

        let mut sql = String::from(
            "SELECT run_id, step_key, recorded_at, project, model, mode, response_id, batch_id,
                    input_tokens, output_tokens, tool_cost, storage_cost, total_cost,
                    cost_estimated, prompt_digest
             FROM receipts",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY recorded_at DESC");
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(1000)));

        let connection = self.connect()?;
        let mut statement = connection.prepare(&sql).map_err(sql_error)?;
        let rows = statement
            .query_map(rusqlite::params_from_iter(values), |row| {
                Ok(Receipt {
                    run_id: row.get(0)?,
                    step_key: row.get(1)?,
                    recorded_at: row.get(2)?,
                    project: row.get(3)?,
                    model: row.get(4)?,
                    mode: row.get(5)?,
                    response_id: row.get(6)?,
                    batch_id: row.get(7)?,
                    input_tokens: row.get::<_, i64>(8)? as u64,
                    output_tokens: row.get::<_, i64>(9)? as u64,
                    tool_cost: row.get(10)?,
                    storage_cost: row.get(11)?,
                    total_cost: row.get(12)?,
                    cost_estimated: row.get::<_, i64>(13)? != 0,
                    prompt_digest: row.get(14)?,
                })
            })
            .map_err(sql_error)?;

        let mut receipts = Vec::new();
        for row in rows {
            receipts.push(row.map_err(sql_error)?);
        }
        Ok(receipts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(run_id: &str, step_key: &str) -> Receipt {
        Receipt {
            run_id: run_id.to_string(),
            step_key: step_key.to_string(),
            recorded_at: 1_700_000_000,
            project: "proj".to_string(),
            model: "m-1".to_string(),
            mode: "GENERATE".to_string(),
            response_id: Some("resp-1".to_string()),
            batch_id: None,
            input_tokens: 100,
            output_tokens: 50,
            tool_cost: 0.0,
            storage_cost: 0.0,
            total_cost: 0.015,
            cost_estimated: false,
            prompt_digest: "make a script".to_string(),
        }
    }

    #[test]
    fn duplicate_keys_are_ignored_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ReceiptLedger::open(&temp.path().join("r.sqlite")).expect("open");
        assert!(ledger.record(&receipt("RUN_A", "A2")).expect("first insert"));
        assert!(!ledger.record(&receipt("RUN_A", "A2")).expect("duplicate insert"));

        let all = ledger.query(&ReceiptQuery::default()).expect("query");
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn query_filters_compose() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ReceiptLedger::open(&temp.path().join("r.sqlite")).expect("open");
        ledger.record(&receipt("RUN_A", "A2")).expect("a2");
        let mut other = receipt("RUN_B", "QA");
        other.mode = "QA".to_string();
        other.model = "m-2".to_string();
        other.response_id = Some("resp-9".to_string());
        other.prompt_digest = "review the tree".to_string();
        ledger.record(&other).expect("qa");

        let by_run = ledger
            .query(&ReceiptQuery {
                run_id: Some("RUN_B".to_string()),
                ..Default::default()
            })
            .expect("by run");
        assert_eq!(by_run.len(), 1);
        assert_eq!(by_run[0].step_key, "QA");

        let by_model_and_digest = ledger
            .query(&ReceiptQuery {
                model: Some("m-2".to_string()),
                digest_contains: Some("review".to_string()),
                ..Default::default()
            })
            .expect("by model");
        assert_eq!(by_model_and_digest.len(), 1);

        let by_response = ledger
            .query(&ReceiptQuery {
                response_id: Some("resp-1".to_string()),
                ..Default::default()
            })
            .expect("by response");
        assert_eq!(by_response[0].run_id, "RUN_A");

        let none = ledger
            .query(&ReceiptQuery {
                since: Some(1_800_000_000),
                ..Default::default()
            })
            .expect("since");
        assert!(none.is_empty());
    }

    #[test]
    fn round_trips_cost_estimation_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ReceiptLedger::open(&temp.path().join("r.sqlite")).expect("open");
        let mut estimated = receipt("RUN_C", "C");
        estimated.cost_estimated = true;
        estimated.batch_id = Some("batch-1".to_string());
        ledger.record(&estimated).expect("record");

        let got = ledger
            .query(&ReceiptQuery {
                batch_id: Some("batch-1".to_string()),
                ..Default::default()
            })
            .expect("query");
        assert!(got[0].cost_estimated);
    }
}
