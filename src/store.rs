//! SQLite tables the frontend reads from
//!
//! Every table write goes through [`PriceStore::upsert`], which runs all
//! upserts for one table inside a single transaction: either the whole batch
//! lands or the table keeps its previous contents.

use bigdecimal::BigDecimal;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Statement};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::SyncError;
use crate::types::{PriceRecord, ShippingRecord, SyncRun, SyncStatus};

/// A record type that maps onto one table keyed by a natural key
pub trait TableRecord {
    const TABLE: &'static str;
    const KEY_COLUMN: &'static str;
    /// Insert-or-update that leaves an identical row untouched
    const UPSERT_SQL: &'static str;

    /// Returns the number of rows changed (0 when the stored row already matched)
    fn upsert(&self, stmt: &mut Statement<'_>, now: &str) -> rusqlite::Result<usize>;
}

impl TableRecord for PriceRecord {
    const TABLE: &'static str = "pricing";
    const KEY_COLUMN: &'static str = "item_name";
    const UPSERT_SQL: &'static str =
        "INSERT INTO pricing (item_name, price, currency, unit, category, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(item_name) DO UPDATE SET
             price = excluded.price,
             currency = excluded.currency,
             unit = excluded.unit,
             category = excluded.category,
             updated_at = excluded.updated_at
         WHERE pricing.price IS NOT excluded.price
            OR pricing.currency IS NOT excluded.currency
            OR pricing.unit IS NOT excluded.unit
            OR pricing.category IS NOT excluded.category";

    fn upsert(&self, stmt: &mut Statement<'_>, now: &str) -> rusqlite::Result<usize> {
        stmt.execute(params![
            self.item_name,
            self.price.to_string(),
            self.currency,
            self.unit,
            self.category,
            now,
        ])
    }
}

impl TableRecord for ShippingRecord {
    const TABLE: &'static str = "shipping";
    const KEY_COLUMN: &'static str = "zone";
    const UPSERT_SQL: &'static str = "INSERT INTO shipping (zone, price, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(zone) DO UPDATE SET
             price = excluded.price,
             updated_at = excluded.updated_at
         WHERE shipping.price IS NOT excluded.price";

    fn upsert(&self, stmt: &mut Statement<'_>, now: &str) -> rusqlite::Result<usize> {
        stmt.execute(params![self.zone, self.price.to_string(), now])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

pub struct PriceStore {
    conn: Connection,
}

fn price_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<BigDecimal> {
    let text: String = row.get(idx)?;
    BigDecimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn price_from_row(row: &Row<'_>) -> rusqlite::Result<PriceRecord> {
    Ok(PriceRecord {
        item_name: row.get(0)?,
        price: price_column(row, 1)?,
        currency: row.get(2)?,
        unit: row.get(3)?,
        category: row.get(4)?,
    })
}

fn shipping_from_row(row: &Row<'_>) -> rusqlite::Result<ShippingRecord> {
    Ok(ShippingRecord {
        zone: row.get(0)?,
        price: price_column(row, 1)?,
    })
}

impl PriceStore {
    pub fn open(config: &DatabaseConfig) -> Result<Self, SyncError> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout())?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, SyncError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SyncError> {
        let schema = include_str!("../schema.sql");
        conn.execute_batch(schema)?;
        Ok(Self { conn })
    }

    /// Upsert every record into `R::TABLE` inside one transaction
    pub fn upsert<R: TableRecord>(
        &mut self,
        records: &BTreeMap<String, R>,
    ) -> Result<UpsertSummary, SyncError> {
        let tx = self.conn.transaction()?;

        let existing: HashSet<String> = {
            let mut stmt = tx.prepare(&format!("SELECT {} FROM {}", R::KEY_COLUMN, R::TABLE))?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<HashSet<String>>>()?;
            keys
        };

        let now = Utc::now().to_rfc3339();
        let mut summary = UpsertSummary::default();
        {
            let mut stmt = tx.prepare(R::UPSERT_SQL)?;
            for (key, record) in records {
                let changed = record.upsert(&mut stmt, &now)?;
                if changed == 0 {
                    summary.unchanged += 1;
                } else if existing.contains(key) {
                    summary.updated += 1;
                } else {
                    summary.inserted += 1;
                }
            }
        }

        // Dropping `tx` on any earlier error rolls the whole batch back
        tx.commit()?;
        debug!(
            "{}: {} inserted, {} updated, {} unchanged",
            R::TABLE,
            summary.inserted,
            summary.updated,
            summary.unchanged
        );
        Ok(summary)
    }

    pub fn prices(&self) -> Result<Vec<PriceRecord>, SyncError> {
        let mut stmt = self.conn.prepare(
            "SELECT item_name, price, currency, unit, category FROM pricing ORDER BY item_name",
        )?;
        let rows = stmt
            .query_map([], price_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn shipping(&self) -> Result<Vec<ShippingRecord>, SyncError> {
        let mut stmt = self
            .conn
            .prepare("SELECT zone, price FROM shipping ORDER BY zone")?;
        let rows = stmt
            .query_map([], shipping_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn price(&self, item_name: &str) -> Result<Option<PriceRecord>, SyncError> {
        let record = self
            .conn
            .query_row(
                "SELECT item_name, price, currency, unit, category FROM pricing WHERE item_name = ?1",
                [item_name],
                price_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn shipping_cost(&self, zone: &str) -> Result<Option<ShippingRecord>, SyncError> {
        let record = self
            .conn
            .query_row(
                "SELECT zone, price FROM shipping WHERE zone = ?1",
                [zone],
                shipping_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn record_run(&self, run: &SyncRun) -> Result<(), SyncError> {
        self.conn.execute(
            "INSERT INTO sync_runs (started_at, finished_at, status, pricing_rows, shipping_rows, prices_updated, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.started_at,
                run.finished_at,
                run.status.as_str(),
                run.pricing_rows as i64,
                run.shipping_rows as i64,
                run.prices_updated,
                run.error,
            ],
        )?;
        Ok(())
    }

    pub fn last_run(&self) -> Result<Option<SyncRun>, SyncError> {
        let run = self
            .conn
            .query_row(
                "SELECT started_at, finished_at, status, pricing_rows, shipping_rows, prices_updated, error
                 FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(SyncRun {
                        started_at: row.get(0)?,
                        finished_at: row.get(1)?,
                        status: SyncStatus::from_str(&row.get::<_, String>(2)?),
                        pricing_rows: row.get::<_, i64>(3)? as usize,
                        shipping_rows: row.get::<_, i64>(4)? as usize,
                        prices_updated: row.get(5)?,
                        error: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(run)
    }
}
