//! In-memory [`SqlSession`] used by service tests.

use crate::error::PgCopyError;
use crate::models::CellValue;
use crate::services::session::{SelectPlan, SqlSession};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Records every statement and answers catalog queries from canned data.
#[derive(Default)]
pub(crate) struct RecordingSession {
    statements: Mutex<Vec<String>>,
    remote_columns: Vec<(String, String)>,
    local_columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
    failing_execs: Vec<usize>,
    exec_count: Mutex<usize>,
    fetch_count: Mutex<usize>,
}

impl RecordingSession {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_remote_columns(mut self, columns: &[(&str, &str)]) -> Self {
        self.remote_columns =
            columns.iter().map(|(n, t)| (n.to_string(), t.to_string())).collect();
        self
    }

    pub(crate) fn with_local_columns(mut self, columns: &[&str]) -> Self {
        self.local_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub(crate) fn with_rows(mut self, rows: Vec<Vec<CellValue>>) -> Self {
        self.rows = rows;
        self
    }

    /// Make the nth (1-based) `dblink_exec` statement fail.
    pub(crate) fn failing_exec(mut self, nth: usize) -> Self {
        self.failing_execs.push(nth);
        self
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub(crate) fn count(&self, statement: &str) -> usize {
        self.statements.lock().iter().filter(|s| s.as_str() == statement).count()
    }

    pub(crate) fn fetch_count(&self) -> usize {
        *self.fetch_count.lock()
    }
}

#[async_trait]
impl SqlSession for RecordingSession {
    async fn batch_execute(&self, sql: &str) -> Result<(), PgCopyError> {
        self.statements.lock().push(sql.to_string());

        if sql.starts_with("SELECT dblink_exec(") {
            let mut count = self.exec_count.lock();
            *count += 1;
            if self.failing_execs.contains(&*count) {
                return Err(PgCopyError::query("invalid input syntax for type integer"));
            }
        }
        Ok(())
    }

    async fn query_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>, PgCopyError> {
        self.statements.lock().push(sql.to_string());

        if sql.contains("FROM dblink(") {
            Ok(self
                .remote_columns
                .iter()
                .map(|(n, t)| vec![Some(n.clone()), Some(t.clone())])
                .collect())
        } else if sql.contains("information_schema.columns") {
            Ok(self.local_columns.iter().map(|c| vec![Some(c.clone())]).collect())
        } else {
            Ok(Vec::new())
        }
    }

    async fn fetch_rows(&self, plan: &SelectPlan) -> Result<Vec<Vec<CellValue>>, PgCopyError> {
        self.statements.lock().push(plan.sql());
        *self.fetch_count.lock() += 1;

        let limit = plan.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(self.rows.iter().take(limit).cloned().collect())
    }
}
