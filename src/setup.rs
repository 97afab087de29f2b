//! Interactive first-run setup
//!
//! Prompts for every setting, showing the current value (or default) in
//! brackets; pressing Enter keeps it.

use anyhow::{bail, Context, Result};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::config::SyncConfig;
use crate::scheduler::DailySchedule;
use crate::sheets::GoogleSheetsClient;
use crate::sync::run_sync;

struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    /// Ask once; empty input returns `default`
    fn ask(&mut self, label: &str, default: &str) -> Result<String> {
        if default.is_empty() {
            write!(self.output, "{}: ", label)?;
        } else {
            write!(self.output, "{} [{}]: ", label, default)?;
        }
        self.output.flush()?;

        let mut line = String::new();
        let read = self.input.read_line(&mut line)?;
        if read == 0 {
            bail!("input closed while waiting for '{}'", label);
        }
        let answer = line.trim();
        Ok(if answer.is_empty() {
            default.to_string()
        } else {
            answer.to_string()
        })
    }

    /// Ask until `parse` accepts the answer
    fn ask_valid<T>(
        &mut self,
        label: &str,
        default: &str,
        parse: impl Fn(&str) -> Result<T>,
    ) -> Result<(String, T)> {
        loop {
            let answer = self.ask(label, default)?;
            match parse(&answer) {
                Ok(value) => return Ok((answer, value)),
                Err(e) => writeln!(self.output, "  Invalid value: {:#}", e)?,
            }
        }
    }

    fn confirm(&mut self, label: &str) -> Result<bool> {
        let answer = self.ask(&format!("{} (y/N)", label), "")?;
        Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
    }
}

fn non_empty(s: &str) -> Result<()> {
    if s.trim().is_empty() {
        bail!("a value is required");
    }
    Ok(())
}

/// Walk through every setting, starting from `current` when there is one
pub fn prompt_config<R: BufRead, W: Write>(
    input: R,
    output: W,
    current: Option<&SyncConfig>,
) -> Result<SyncConfig> {
    let mut p = Prompter { input, output };
    let mut config = current.cloned().unwrap_or_else(|| SyncConfig::new(""));

    writeln!(p.output, "Spreadsheet")?;
    let (id, _) = p.ask_valid("  Google Sheets ID", &config.spreadsheet.id, non_empty)?;
    config.spreadsheet.id = id;
    let (pricing, _) = p.ask_valid(
        "  Pricing sheet name",
        &config.spreadsheet.pricing_sheet,
        non_empty,
    )?;
    config.spreadsheet.pricing_sheet = pricing;
    let (shipping, _) = p.ask_valid(
        "  Shipping sheet name",
        &config.spreadsheet.shipping_sheet,
        non_empty,
    )?;
    config.spreadsheet.shipping_sheet = shipping;
    let credentials = p.ask(
        "  Service account key file",
        &config.spreadsheet.credentials_path.display().to_string(),
    )?;
    config.spreadsheet.credentials_path = PathBuf::from(credentials);
    let (_, header_rows) = p.ask_valid(
        "  Header rows per sheet",
        &config.spreadsheet.header_rows.to_string(),
        |s| s.parse::<usize>().context("expected a whole number"),
    )?;
    config.spreadsheet.header_rows = header_rows;

    writeln!(p.output, "Database")?;
    let db_path = p.ask("  SQLite file", &config.database.path.display().to_string())?;
    config.database.path = PathBuf::from(db_path);

    writeln!(p.output, "Schedule")?;
    let (daily_at, _) = p.ask_valid(
        "  Daily sync time (HH:MM, local)",
        &config.schedule.daily_at,
        DailySchedule::parse,
    )?;
    config.schedule.daily_at = daily_at;

    config.validate()?;
    Ok(config)
}

/// `price-sync setup`: prompt, save, and optionally run a test sync
pub fn run_setup(config_path: &Path) -> Result<()> {
    let current = if config_path.exists() {
        match SyncConfig::load(config_path) {
            Ok(config) => Some(config),
            Err(e) => {
                println!("Existing config could not be loaded ({:#}), starting fresh", e);
                None
            }
        }
    } else {
        None
    };

    println!("price-sync setup (press Enter to keep the value in brackets)\n");
    let stdin = io::stdin();
    let config = prompt_config(stdin.lock(), io::stdout(), current.as_ref())?;
    config.save(config_path)?;
    println!("\nSaved configuration to {}", config_path.display());

    let mut p = Prompter {
        input: stdin.lock(),
        output: io::stdout(),
    };
    if p.confirm("Run a test sync now?")? {
        let client = GoogleSheetsClient::new(&config.spreadsheet.credentials_path)?;
        match run_sync(&config, &client) {
            Ok(report) => println!(
                "Test sync succeeded: {} pricing rows, {} shipping rows",
                report.pricing.summary.total(),
                report.shipping.summary.total()
            ),
            Err(e) => println!("Test sync failed: {}", e),
        }
    }
    Ok(())
}
