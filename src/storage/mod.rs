//! Result persistence
//!
//! The engine hands every finished pass to a [`ResultSink`]. The bundled
//! sink is a SQLite database holding one JSON document per property,
//! valuation, fraud signal, quarantined record and event.

pub mod cache;

#[cfg(test)]
mod tests;

use crate::engine::BatchOutput;
use crate::error::Result;
use crate::fraud::{FraudSignal, RiskTier};
use crate::normalize::Rejection;
use crate::types::{CanonicalProperty, ClusterId};
use crate::valuation::ValuationResult;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use tracing::info;

/// Consumer of published batch results
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, output: &BatchOutput) -> Result<()>;
}

/// Database for storing resolved, valued and scored properties
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to SQLite database (creates if not exists)
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db_url = format!("sqlite:{}?mode=rwc", path.as_ref().display());

        let pool = SqlitePoolOptions::new().max_connections(5).connect(&db_url).await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs
    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canonical_properties (
                id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                city TEXT NOT NULL,
                neighborhood TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS valuations (
                cluster_id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL,
                estimate TEXT,
                tier TEXT NOT NULL,
                data TEXT NOT NULL,
                computed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fraud_signals (
                cluster_id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL,
                score TEXT NOT NULL,
                tier TEXT NOT NULL,
                data TEXT NOT NULL,
                computed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quarantine (
                listing_key TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                detail TEXT NOT NULL,
                data TEXT NOT NULL,
                quarantined_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                cluster_id INTEGER,
                data TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist one pass atomically
    pub async fn save_batch(&self, output: &BatchOutput) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for property in &output.properties {
            save_property(&mut tx, property).await?;
        }
        for valuation in &output.valuations {
            save_valuation(&mut tx, valuation).await?;
        }
        for signal in &output.fraud_signals {
            save_fraud_signal(&mut tx, signal).await?;
        }
        for rejection in &output.quarantined {
            save_rejection(&mut tx, rejection, output).await?;
        }
        for event in &output.events {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO events (id, batch_id, kind, cluster_id, data, timestamp)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.id)
            .bind(&output.batch_id)
            .bind(event.kind().to_string())
            .bind(event.cluster_id().map(|id| id.0 as i64))
            .bind(serde_json::to_string(event)?)
            .bind(event.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            "Saved batch {}: {} properties, {} valuations, {} fraud signals, {} quarantined, {} events",
            output.batch_id,
            output.properties.len(),
            output.valuations.len(),
            output.fraud_signals.len(),
            output.quarantined.len(),
            output.events.len()
        );
        Ok(())
    }

    pub async fn get_property(&self, id: ClusterId) -> Result<Option<CanonicalProperty>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM canonical_properties WHERE id = ?")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(data,)| serde_json::from_str(&data).map_err(Into::into))
            .transpose()
    }

    pub async fn get_valuation(&self, id: ClusterId) -> Result<Option<ValuationResult>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM valuations WHERE cluster_id = ?")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(data,)| serde_json::from_str(&data).map_err(Into::into))
            .transpose()
    }

    pub async fn get_fraud_signal(&self, id: ClusterId) -> Result<Option<FraudSignal>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM fraud_signals WHERE cluster_id = ?")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(data,)| serde_json::from_str(&data).map_err(Into::into))
            .transpose()
    }

    /// Every stored property, tombstones included, for restoring an engine
    pub async fn load_properties(&self) -> Result<Vec<CanonicalProperty>> {
        load_all(&self.pool, "SELECT data FROM canonical_properties ORDER BY id").await
    }

    pub async fn load_valuations(&self) -> Result<Vec<ValuationResult>> {
        load_all(&self.pool, "SELECT data FROM valuations ORDER BY cluster_id").await
    }

    pub async fn load_fraud_signals(&self) -> Result<Vec<FraudSignal>> {
        load_all(&self.pool, "SELECT data FROM fraud_signals ORDER BY cluster_id").await
    }

    /// Signals at or above `tier`, highest score first
    pub async fn risky_properties(&self, tier: RiskTier) -> Result<Vec<FraudSignal>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM fraud_signals")
            .fetch_all(&self.pool)
            .await?;

        let mut signals = rows
            .into_iter()
            .map(|(data,)| serde_json::from_str::<FraudSignal>(&data))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        signals.retain(|s| s.tier >= tier);
        signals.sort_by(|a, b| b.score.cmp(&a.score).then(a.cluster_id.cmp(&b.cluster_id)));
        Ok(signals)
    }

    pub async fn get_quarantined(&self) -> Result<Vec<Rejection>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT data FROM quarantine ORDER BY listing_key")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(data,)| serde_json::from_str(&data).map_err(Into::into))
            .collect()
    }

    pub async fn event_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl ResultSink for Database {
    async fn publish(&self, output: &BatchOutput) -> Result<()> {
        self.save_batch(output).await
    }
}

async fn load_all<T: serde::de::DeserializeOwned>(pool: &SqlitePool, query: &str) -> Result<Vec<T>> {
    let rows: Vec<(String,)> = sqlx::query_as(query).fetch_all(pool).await?;
    rows.into_iter()
        .map(|(data,)| serde_json::from_str(&data).map_err(Into::into))
        .collect()
}

// Upserts never replace a row with an older cluster version.

async fn save_property(tx: &mut Transaction<'_, Sqlite>, property: &CanonicalProperty) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO canonical_properties (id, version, status, city, neighborhood, data, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            version = excluded.version,
            status = excluded.status,
            city = excluded.city,
            neighborhood = excluded.neighborhood,
            data = excluded.data,
            updated_at = excluded.updated_at
        WHERE excluded.version >= canonical_properties.version
        "#,
    )
    .bind(property.id.0 as i64)
    .bind(property.version as i64)
    .bind(property.status.to_string())
    .bind(&property.partition.city)
    .bind(&property.partition.neighborhood)
    .bind(serde_json::to_string(property)?)
    .bind(property.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn save_valuation(tx: &mut Transaction<'_, Sqlite>, valuation: &ValuationResult) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO valuations (cluster_id, version, estimate, tier, data, computed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(cluster_id) DO UPDATE SET
            version = excluded.version,
            estimate = excluded.estimate,
            tier = excluded.tier,
            data = excluded.data,
            computed_at = excluded.computed_at
        WHERE excluded.version >= valuations.version
        "#,
    )
    .bind(valuation.cluster_id.0 as i64)
    .bind(valuation.version as i64)
    .bind(valuation.estimate.map(|e| e.to_string()))
    .bind(format!("{:?}", valuation.tier))
    .bind(serde_json::to_string(valuation)?)
    .bind(valuation.computed_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn save_fraud_signal(tx: &mut Transaction<'_, Sqlite>, signal: &FraudSignal) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO fraud_signals (cluster_id, version, score, tier, data, computed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(cluster_id) DO UPDATE SET
            version = excluded.version,
            score = excluded.score,
            tier = excluded.tier,
            data = excluded.data,
            computed_at = excluded.computed_at
        WHERE excluded.version >= fraud_signals.version
        "#,
    )
    .bind(signal.cluster_id.0 as i64)
    .bind(signal.version as i64)
    .bind(signal.score.to_string())
    .bind(format!("{:?}", signal.tier))
    .bind(serde_json::to_string(signal)?)
    .bind(signal.computed_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn save_rejection(tx: &mut Transaction<'_, Sqlite>, rejection: &Rejection, output: &BatchOutput) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO quarantine (listing_key, reason, detail, data, quarantined_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(listing_key) DO UPDATE SET
            reason = excluded.reason,
            detail = excluded.detail,
            data = excluded.data,
            quarantined_at = excluded.quarantined_at
        "#,
    )
    .bind(rejection.key.to_string())
    .bind(rejection.reason.to_string())
    .bind(&rejection.detail)
    .bind(serde_json::to_string(rejection)?)
    .bind(output.as_of.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}
