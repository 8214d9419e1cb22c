use crate::{
    error::{GatewayError, Result},
    model::{Network, SettlementOutcome, SettlementResult},
    negotiator::CheckoutSession,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::{SqliteConnectOptions, SqlitePoolOptions}, Row, SqlitePool};
use std::str::FromStr;

/// Archived session plus any outcome a later reconciliation pass observed.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedSession {
    pub session: CheckoutSession,
    pub reconciliation: Option<SettlementResult>,
    pub archived_at: DateTime<Utc>,
}

/// A `timed_out` settlement that may still resolve on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReconciliation {
    pub session_id: String,
    pub attempt: u32,
    pub network: Network,
    pub tx_reference: String,
}

/// Durable record of terminal checkout sessions.
pub struct SessionArchive {
    pool: SqlitePool,
}

impl SessionArchive {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(
                SqliteConnectOptions::from_str(database_url)?
                    .create_if_missing(true)
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
            )
            .await?;

        let archive = Self { pool };
        archive.migrate().await?;
        Ok(archive)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkout_sessions (
                session_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                instance_id TEXT NOT NULL UNIQUE,
                agent_id TEXT NOT NULL,
                state TEXT NOT NULL,
                amount TEXT NOT NULL,
                network TEXT,
                tx_reference TEXT,
                outcome TEXT,
                record TEXT NOT NULL,
                archived_at DATETIME NOT NULL,
                PRIMARY KEY (session_id, attempt)
            );

            CREATE TABLE IF NOT EXISTS reconciliations (
                session_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                tx_reference TEXT,
                record TEXT NOT NULL,
                reconciled_at DATETIME NOT NULL,
                PRIMARY KEY (session_id, attempt),
                FOREIGN KEY (session_id, attempt) REFERENCES checkout_sessions(session_id, attempt)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_agent ON checkout_sessions(agent_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_outcome ON checkout_sessions(outcome);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Terminal attempts are immutable. Re-archiving the same instance is a
    /// no-op; a different instance under an archived attempt number is a conflict.
    pub async fn archive_session(&self, session: &CheckoutSession) -> Result<()> {
        let record = serde_json::to_string(session)?;
        let settlement = session.settlement_result.as_ref();
        let inserted = sqlx::query(
            r#"
            INSERT INTO checkout_sessions (session_id, attempt, instance_id, agent_id, state, amount, network, tx_reference, outcome, record, archived_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&session.session_id)
        .bind(session.attempt)
        .bind(session.instance_id.to_string())
        .bind(&session.agent_id)
        .bind(session.state.as_str())
        .bind(session.amount.to_string())
        .bind(session.payment_requirement.as_ref().map(|r| r.network.caip2()))
        .bind(settlement.and_then(|s| s.tx_reference.clone()))
        .bind(settlement.map(|s| outcome_str(s.outcome)))
        .bind(record)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(());
        }

        let existing = sqlx::query(
            r#"
            SELECT session_id, attempt FROM checkout_sessions WHERE instance_id = ?
            "#,
        )
        .bind(session.instance_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(row)
                if row.get::<String, _>(0) == session.session_id
                    && row.get::<u32, _>(1) == session.attempt =>
            {
                Ok(())
            }
            _ => Err(GatewayError::ArchiveConflict(format!(
                "{} attempt {} is already archived for another instance",
                session.session_id, session.attempt
            ))),
        }
    }

    pub async fn latest_attempt(&self, session_id: &str) -> Result<Option<u32>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(attempt) FROM checkout_sessions WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<Option<u32>, _>(0))
    }

    /// Latest archived attempt for `session_id`.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<ArchivedSession>> {
        let row = sqlx::query(
            r#"
            SELECT s.record, s.archived_at, r.record
            FROM checkout_sessions s
            LEFT JOIN reconciliations r ON r.session_id = s.session_id AND r.attempt = s.attempt
            WHERE s.session_id = ?
            ORDER BY s.attempt DESC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let session: CheckoutSession = serde_json::from_str(&row.get::<String, _>(0))?;
                let reconciliation = row
                    .get::<Option<String>, _>(2)
                    .map(|record| serde_json::from_str(&record))
                    .transpose()?;
                Ok(Some(ArchivedSession {
                    session,
                    reconciliation,
                    archived_at: row.get(1),
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn timed_out_settlements(&self) -> Result<Vec<PendingReconciliation>> {
        let rows = sqlx::query(
            r#"
            SELECT s.session_id, s.attempt, s.network, s.tx_reference
            FROM checkout_sessions s
            LEFT JOIN reconciliations r ON r.session_id = s.session_id AND r.attempt = s.attempt
            WHERE s.outcome = 'timed_out' AND s.tx_reference IS NOT NULL AND r.session_id IS NULL
            ORDER BY s.archived_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::new();
        for row in rows {
            let network: String = row.get(2);
            pending.push(PendingReconciliation {
                session_id: row.get(0),
                attempt: row.get(1),
                network: network.parse()?,
                tx_reference: row.get(3),
            });
        }

        Ok(pending)
    }

    /// Records a late terminal outcome next to the archived attempt. The attempt itself is unchanged.
    pub async fn record_reconciliation(&self, pending: &PendingReconciliation, result: &SettlementResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliations (session_id, attempt, outcome, tx_reference, record, reconciled_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, attempt) DO NOTHING
            "#,
        )
        .bind(&pending.session_id)
        .bind(pending.attempt)
        .bind(outcome_str(result.outcome))
        .bind(&result.tx_reference)
        .bind(serde_json::to_string(result)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_by_outcome(&self, outcome: SettlementOutcome) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FROM checkout_sessions WHERE outcome = ?
            "#,
        )
        .bind(outcome_str(outcome))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get(0))
    }
}

fn outcome_str(outcome: SettlementOutcome) -> &'static str {
    match outcome {
        SettlementOutcome::Confirmed => "confirmed",
        SettlementOutcome::Failed => "failed",
        SettlementOutcome::TimedOut => "timed_out",
    }
}
