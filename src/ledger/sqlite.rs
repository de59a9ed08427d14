use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use super::{Ledger, LedgerError};
use crate::db::Database;

/// Ledger stored in the `processed_cases` table.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    db: Database,
}

impl SqliteLedger {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn load(&self) -> Result<HashSet<String>, LedgerError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT case_id FROM processed_cases")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn contains(&self, case_id: &str) -> Result<bool, LedgerError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM processed_cases WHERE case_id = ?")
            .bind(case_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    async fn commit(&self, case_id: &str) -> Result<(), LedgerError> {
        let result = sqlx::query("INSERT OR IGNORE INTO processed_cases (case_id) VALUES (?)")
            .bind(case_id)
            .execute(self.db.pool())
            .await?;
        debug!(case_id, new = result.rows_affected() > 0, "ledger commit");
        Ok(())
    }
}
