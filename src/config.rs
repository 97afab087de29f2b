//! TOML configuration for the sync service
//!
//! The file is written by `price-sync setup` and loaded once at process start.
//! Every component receives the parts it needs by reference.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::normalize::CellRef;
use crate::scheduler::DailySchedule;

pub const DEFAULT_CONFIG_PATH: &str = "price-sync.toml";
/// Upper bound on a single retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub spreadsheet: SpreadsheetConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadsheetConfig {
    /// Document ID as it appears in the sheet URL
    pub id: String,
    #[serde(default = "default_pricing_sheet")]
    pub pricing_sheet: String,
    #[serde(default = "default_shipping_sheet")]
    pub shipping_sheet: String,
    /// Service-account JSON key
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    /// Leading rows of each tab that hold headers, not data
    #[serde(default = "default_header_rows")]
    pub header_rows: usize,
    /// Cell of the pricing tab holding a "last updated" note, e.g. "D1"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_cell: Option<String>,
}

impl SpreadsheetConfig {
    pub fn updated_cell_ref(&self) -> Result<Option<CellRef>> {
        self.updated_cell
            .as_deref()
            .map(|cell| {
                CellRef::parse(cell)
                    .with_context(|| format!("Invalid spreadsheet.updated_cell '{}'", cell))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("prices.db"),
            busy_timeout_secs: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local wall-clock time of the daily sync, `HH:MM` or `HH:MM:SS`
    pub daily_at: String,
    /// Run one cycle immediately when the service starts
    pub run_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_at: "00:00".to_string(),
            run_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per sheet fetch, including the first one
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 2,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based), capped at `MAX_BACKOFF`
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

fn default_pricing_sheet() -> String {
    "Prices".to_string()
}

fn default_shipping_sheet() -> String {
    "Shipping".to_string()
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("google.json")
}

fn default_header_rows() -> usize {
    1
}

impl SyncConfig {
    pub fn new(spreadsheet_id: impl Into<String>) -> Self {
        Self {
            spreadsheet: SpreadsheetConfig {
                id: spreadsheet_id.into(),
                pricing_sheet: default_pricing_sheet(),
                shipping_sheet: default_shipping_sheet(),
                credentials_path: default_credentials_path(),
                header_rows: default_header_rows(),
                updated_cell: None,
            },
            database: DatabaseConfig::default(),
            schedule: ScheduleConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: SyncConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.spreadsheet.id.trim().is_empty() {
            bail!("spreadsheet.id must not be empty");
        }
        if self.spreadsheet.pricing_sheet.trim().is_empty()
            || self.spreadsheet.shipping_sheet.trim().is_empty()
        {
            bail!("sheet names must not be empty");
        }
        if self.spreadsheet.pricing_sheet == self.spreadsheet.shipping_sheet {
            bail!(
                "pricing and shipping sheets must differ (both are '{}')",
                self.spreadsheet.pricing_sheet
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            bail!("retry.backoff_multiplier must be >= 1.0");
        }
        self.daily_schedule()?;
        self.spreadsheet.updated_cell_ref()?;
        Ok(())
    }

    pub fn daily_schedule(&self) -> Result<DailySchedule> {
        DailySchedule::parse(&self.schedule.daily_at)
            .with_context(|| format!("Invalid schedule.daily_at '{}'", self.schedule.daily_at))
    }
}
