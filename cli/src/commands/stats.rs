use anyhow::Result;

use foodscan_core::service::CatalogService;

use super::helpers::{format_timestamp, print_scan_table};

pub(crate) fn cmd_stats(svc: &CatalogService, json: bool) -> Result<()> {
    let stats = svc.stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Products:        {}", stats.product_count);
    println!("Newest record:   {}", format_timestamp(stats.last_updated));
    println!("Dataset version: {}", format_timestamp(stats.version_marker));
    println!(
        "Phrase tables:   {}",
        stats
            .phrase_table_version
            .map_or_else(|| "-".to_string(), |v| format!("v{v}"))
    );
    if stats.version_marker.is_none() {
        eprintln!("\nCatalog has never been synced. Run `foodscan sync`.");
    }
    Ok(())
}

pub(crate) fn cmd_history(svc: &CatalogService, limit: i64, json: bool) -> Result<()> {
    let scans = svc.recent_scans(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&scans)?);
        return Ok(());
    }

    if scans.is_empty() {
        eprintln!("No scans yet.");
        return Ok(());
    }
    print_scan_table(&scans);
    Ok(())
}
