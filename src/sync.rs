use chrono::Utc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{RetryConfig, SyncConfig};
use crate::error::SyncError;
use crate::normalize::{normalize_prices, normalize_shipping, updated_marker, Normalized};
use crate::sheets::SheetSource;
use crate::store::{PriceStore, UpsertSummary};
use crate::types::{SyncRun, SyncStatus};
use crate::utils::abbreviate;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableReport {
    /// Data rows read from the tab, headers excluded
    pub fetched_rows: usize,
    pub skipped_rows: usize,
    pub summary: UpsertSummary,
}

impl TableReport {
    fn new<T>(fetched_rows: usize, normalized: &Normalized<T>, summary: UpsertSummary) -> Self {
        Self {
            fetched_rows,
            skipped_rows: normalized.skipped.len(),
            summary,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pricing: TableReport,
    pub shipping: TableReport,
    pub prices_updated: Option<String>,
}

/// Call `fetch` until it succeeds, fails for good, or runs out of attempts.
/// Only transient errors are retried.
pub fn with_retry<T>(
    retry: &RetryConfig,
    what: &str,
    mut sleep: impl FnMut(Duration),
    mut fetch: impl FnMut() -> Result<T, SyncError>,
) -> Result<T, SyncError> {
    let mut attempt = 1;
    loop {
        match fetch() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    what, attempt, retry.max_attempts, e, delay
                );
                sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fetch → normalize → write for both tabs.
///
/// Both tabs are fetched and normalized before anything is written. Each
/// table is then written in its own transaction.
pub fn run_cycle<S: SheetSource>(
    config: &SyncConfig,
    source: &S,
    store: &mut PriceStore,
    mut sleep: impl FnMut(Duration),
) -> Result<CycleReport, SyncError> {
    let sheet = &config.spreadsheet;
    let header_rows = sheet.header_rows;
    let updated_cell = sheet
        .updated_cell_ref()
        .map_err(|e| SyncError::Config(format!("{:#}", e)))?;

    let pricing_rows = with_retry(&config.retry, &sheet.pricing_sheet, &mut sleep, || {
        source.fetch_rows(&sheet.id, &sheet.pricing_sheet)
    })?;
    let shipping_rows = with_retry(&config.retry, &sheet.shipping_sheet, &mut sleep, || {
        source.fetch_rows(&sheet.id, &sheet.shipping_sheet)
    })?;

    let prices_updated = updated_cell.and_then(|cell| updated_marker(&pricing_rows, cell));
    let prices = normalize_prices(&pricing_rows, header_rows);
    let shipping = normalize_shipping(&shipping_rows, header_rows);

    let pricing_summary = store.upsert(&prices.records)?;
    let shipping_summary = store.upsert(&shipping.records)?;

    Ok(CycleReport {
        pricing: TableReport::new(
            pricing_rows.len().saturating_sub(header_rows),
            &prices,
            pricing_summary,
        ),
        shipping: TableReport::new(
            shipping_rows.len().saturating_sub(header_rows),
            &shipping,
            shipping_summary,
        ),
        prices_updated,
    })
}

fn log_report(report: &CycleReport) {
    for (table, t) in [("pricing", &report.pricing), ("shipping", &report.shipping)] {
        info!(
            "{}: {} rows read, {} skipped, {} inserted, {} updated, {} unchanged",
            table,
            t.fetched_rows,
            t.skipped_rows,
            t.summary.inserted,
            t.summary.updated,
            t.summary.unchanged
        );
    }
    if let Some(updated) = &report.prices_updated {
        info!("Prices last updated: {}", updated);
    }
}

/// One complete sync cycle against the configured database, recorded in `sync_runs`
pub fn run_sync<S: SheetSource>(config: &SyncConfig, source: &S) -> Result<CycleReport, SyncError> {
    let started_at = Utc::now();
    info!(
        "Syncing spreadsheet {} (pricing '{}', shipping '{}')",
        abbreviate(&config.spreadsheet.id),
        config.spreadsheet.pricing_sheet,
        config.spreadsheet.shipping_sheet
    );

    let mut store = PriceStore::open(&config.database)?;
    let result = run_cycle(config, source, &mut store, thread::sleep);

    let run = match &result {
        Ok(report) => {
            log_report(report);
            SyncRun {
                started_at: started_at.to_rfc3339(),
                finished_at: Utc::now().to_rfc3339(),
                status: SyncStatus::Success,
                pricing_rows: report.pricing.summary.total(),
                shipping_rows: report.shipping.summary.total(),
                prices_updated: report.prices_updated.clone(),
                error: None,
            }
        }
        Err(e) => {
            if let SyncError::NotFound(_) = e {
                error!(
                    "Spreadsheet or tab not found, check the configuration (re-run `price-sync setup`)"
                );
            }
            SyncRun {
                started_at: started_at.to_rfc3339(),
                finished_at: Utc::now().to_rfc3339(),
                status: SyncStatus::Failed,
                pricing_rows: 0,
                shipping_rows: 0,
                prices_updated: None,
                error: Some(format!("[{}] {}", e.kind(), e)),
            }
        }
    };

    if let Err(e) = store.record_run(&run) {
        warn!("Failed to record sync run: {}", e);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    /// Serves canned rows per tab; queued errors are returned first
    #[derive(Default)]
    struct FakeSheets {
        tabs: HashMap<String, Vec<Vec<String>>>,
        errors: RefCell<HashMap<String, VecDeque<SyncError>>>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeSheets {
        fn with_tab(mut self, name: &str, rows: &[&[&str]]) -> Self {
            let rows = rows
                .iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect();
            self.tabs.insert(name.to_string(), rows);
            self
        }

        fn fail_next(self, name: &str, err: SyncError) -> Self {
            self.errors
                .borrow_mut()
                .entry(name.to_string())
                .or_default()
                .push_back(err);
            self
        }
    }

    impl SheetSource for FakeSheets {
        fn fetch_rows(&self, _id: &str, sheet: &str) -> Result<Vec<Vec<String>>, SyncError> {
            self.calls.borrow_mut().push(sheet.to_string());
            if let Some(err) = self
                .errors
                .borrow_mut()
                .get_mut(sheet)
                .and_then(|q| q.pop_front())
            {
                return Err(err);
            }
            self.tabs
                .get(sheet)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("sheet '{}'", sheet)))
        }
    }

    fn source() -> FakeSheets {
        FakeSheets::default()
            .with_tab(
                "Prices",
                &[
                    &["Item", "Price", "Currency", "Updated 2026-Mar-01"],
                    &["Widget", "9.99", "USD"],
                    &["Gadget", "14.50", "USD"],
                    &["Broken", "tbd"],
                ],
            )
            .with_tab(
                "Shipping",
                &[&["Zone", "Price"], &["Domestic", "5"], &["International", "19.90"]],
            )
    }

    fn config() -> SyncConfig {
        SyncConfig::new("sheet-id")
    }

    fn no_sleep(_: Duration) {}

    #[test]
    fn test_cycle_writes_both_tables() {
        let mut store = PriceStore::open_in_memory().unwrap();
        let report = run_cycle(&config(), &source(), &mut store, no_sleep).unwrap();

        assert_eq!(report.pricing.fetched_rows, 3);
        assert_eq!(report.pricing.skipped_rows, 1);
        assert_eq!(report.pricing.summary.inserted, 2);
        assert_eq!(report.shipping.summary.inserted, 2);

        let widget = store.price("Widget").unwrap().unwrap();
        assert_eq!(widget.price.to_string(), "9.99");
        assert_eq!(widget.currency.as_deref(), Some("USD"));
        assert_eq!(
            store.shipping_cost("Domestic").unwrap().unwrap().price.to_string(),
            "5.00"
        );
    }

    #[test]
    fn test_second_cycle_changes_nothing() {
        let mut store = PriceStore::open_in_memory().unwrap();
        let source = source();
        run_cycle(&config(), &source, &mut store, no_sleep).unwrap();
        let before = (store.prices().unwrap(), store.shipping().unwrap());

        let report = run_cycle(&config(), &source, &mut store, no_sleep).unwrap();

        assert_eq!(report.pricing.summary.unchanged, 2);
        assert_eq!(report.shipping.summary.unchanged, 2);
        assert_eq!((store.prices().unwrap(), store.shipping().unwrap()), before);
    }

    #[test]
    fn test_transient_errors_are_retried_with_backoff() {
        let mut store = PriceStore::open_in_memory().unwrap();
        let source = source()
            .fail_next("Prices", SyncError::Transient("connection reset".into()))
            .fail_next("Prices", SyncError::Transient("timeout".into()));
        let mut slept = Vec::new();

        let report = run_cycle(&config(), &source, &mut store, |d| slept.push(d)).unwrap();

        assert_eq!(report.pricing.summary.inserted, 2);
        assert_eq!(slept, vec![Duration::from_secs(2), Duration::from_secs(4)]);
        assert_eq!(source.calls.borrow().len(), 4);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut store = PriceStore::open_in_memory().unwrap();
        let mut source = source();
        for _ in 0..3 {
            source = source.fail_next("Shipping", SyncError::Transient("503".into()));
        }

        let err = run_cycle(&config(), &source, &mut store, no_sleep).unwrap_err();

        assert!(matches!(err, SyncError::Transient(_)));
        // Pricing was fetched but nothing is written when shipping cannot be read
        assert!(store.prices().unwrap().is_empty());
    }

    #[test]
    fn test_auth_error_is_not_retried() {
        let mut store = PriceStore::open_in_memory().unwrap();
        let source = source().fail_next("Prices", SyncError::Auth("expired".into()));

        let err = run_cycle(&config(), &source, &mut store, no_sleep).unwrap_err();

        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(*source.calls.borrow(), vec!["Prices".to_string()]);
    }

    #[test]
    fn test_unknown_tab_is_not_found() {
        let mut store = PriceStore::open_in_memory().unwrap();
        let mut config = config();
        config.spreadsheet.shipping_sheet = "Freight".to_string();

        let err = run_cycle(&config, &source(), &mut store, no_sleep).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(ref msg) if msg.contains("Freight")));
    }

    #[test]
    fn test_cycle_reads_updated_marker() {
        let mut store = PriceStore::open_in_memory().unwrap();
        let source = FakeSheets::default()
            .with_tab(
                "Prices",
                &[&["Item", "Price", "", "Updated 2023-Feb-19"], &["Widget", "9.99"]],
            )
            .with_tab("Shipping", &[&["Zone", "Price"], &["EU", "12"]]);
        let mut config = config();
        config.spreadsheet.updated_cell = Some("D1".to_string());

        let report = run_cycle(&config, &source, &mut store, no_sleep).unwrap();
        assert_eq!(report.prices_updated.as_deref(), Some("2023-02-19"));
        assert_eq!(report.pricing.summary.inserted, 1);

        // Without a configured cell nothing is read
        let report = run_cycle(&self::config(), &source, &mut store, no_sleep).unwrap();
        assert_eq!(report.prices_updated, None);
    }

    #[test]
    fn test_run_sync_records_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.spreadsheet.updated_cell = Some("D1".to_string());
        config.database = DatabaseConfig {
            path: dir.path().join("prices.db"),
            busy_timeout_secs: 1,
        };

        run_sync(&config, &source()).unwrap();
        let store = PriceStore::open(&config.database).unwrap();
        let run = store.last_run().unwrap().unwrap();
        assert_eq!(run.status, SyncStatus::Success);
        assert_eq!(run.pricing_rows, 2);
        assert_eq!(run.shipping_rows, 2);
        assert_eq!(run.prices_updated.as_deref(), Some("2026-03-01"));

        let failing = source().fail_next("Prices", SyncError::Auth("key disabled".into()));
        assert!(run_sync(&config, &failing).is_err());
        let run = store.last_run().unwrap().unwrap();
        assert_eq!(run.status, SyncStatus::Failed);
        assert_eq!(run.prices_updated, None);
        assert_eq!(
            run.error.as_deref(),
            Some("[auth] authentication failed: key disabled")
        );
        // The failed cycle left the previous data in place
        assert_eq!(store.prices().unwrap().len(), 2);
    }
}
