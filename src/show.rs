//! `price-sync show`: dump what the frontend currently sees

use anyhow::Result;
use std::io::Write;

use crate::types::{PriceRecord, ShippingRecord, SyncRun};

/// One CSV with a `table` column so both tables fit in a single stream
pub fn write_csv<W: Write>(
    writer: W,
    prices: &[PriceRecord],
    shipping: &[ShippingRecord],
) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(["table", "key", "price", "currency", "unit", "category"])?;
    for p in prices {
        wtr.write_record([
            "pricing",
            p.item_name.as_str(),
            p.price.to_string().as_str(),
            p.currency.as_deref().unwrap_or(""),
            p.unit.as_deref().unwrap_or(""),
            p.category.as_deref().unwrap_or(""),
        ])?;
    }
    for s in shipping {
        wtr.write_record(["shipping", s.zone.as_str(), s.price.to_string().as_str(), "", "", ""])?;
    }
    wtr.flush()?;
    Ok(())
}

fn price_line(p: &PriceRecord, width: usize) -> String {
    let meta: Vec<&str> = [&p.currency, &p.unit, &p.category]
        .into_iter()
        .filter_map(|v| v.as_deref())
        .collect();
    format!(
        "{:<width$}  {:>10}  {}",
        p.item_name,
        p.price.to_string(),
        meta.join(" / "),
        width = width
    )
    .trim_end()
    .to_string()
}

fn shipping_line(s: &ShippingRecord, width: usize) -> String {
    format!("{:<width$}  {:>10}", s.zone, s.price.to_string(), width = width)
}

/// `show --item`: a single pricing row
pub fn write_price<W: Write>(mut out: W, record: &PriceRecord) -> Result<()> {
    writeln!(out, "{}", price_line(record, 0))?;
    Ok(())
}

/// `show --zone`: a single shipping row
pub fn write_shipping_cost<W: Write>(mut out: W, record: &ShippingRecord) -> Result<()> {
    writeln!(out, "{}", shipping_line(record, 0))?;
    Ok(())
}

pub fn write_tables<W: Write>(
    mut out: W,
    prices: &[PriceRecord],
    shipping: &[ShippingRecord],
    last_run: Option<&SyncRun>,
) -> Result<()> {
    let name_width = prices
        .iter()
        .map(|p| p.item_name.chars().count())
        .chain(shipping.iter().map(|s| s.zone.chars().count()))
        .max()
        .unwrap_or(0)
        .max(4);

    writeln!(out, "Pricing ({} items)", prices.len())?;
    for p in prices {
        writeln!(out, "  {}", price_line(p, name_width))?;
    }

    writeln!(out, "\nShipping ({} zones)", shipping.len())?;
    for s in shipping {
        writeln!(out, "  {}", shipping_line(s, name_width))?;
    }

    match last_run {
        Some(run) => {
            write!(out, "\nLast sync: {} at {}", run.status.as_str(), run.finished_at)?;
            match &run.error {
                Some(err) => writeln!(out, " ({})", err)?,
                None => writeln!(out)?,
            }
            if let Some(updated) = &run.prices_updated {
                writeln!(out, "Prices last updated: {}", updated)?;
            }
        }
        None => writeln!(out, "\nLast sync: never")?,
    }
    Ok(())
}
