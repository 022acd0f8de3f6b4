use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::runtime::Handle;

use foodscan_core::models::SyncOutcome;
use foodscan_core::service::CatalogService;
use foodscan_core::sync::{CancelToken, SyncPhase, SyncProgress};

use super::helpers::format_timestamp;
use crate::dataset::HttpDatasetSource;

pub(crate) async fn cmd_sync(
    svc: Arc<CatalogService>,
    data_url: Option<&str>,
    json: bool,
) -> Result<()> {
    let Some(data_url) = data_url else {
        bail!("No dataset URL configured. Pass --data-url or set FOODSCAN_DATA_URL");
    };
    let source = HttpDatasetSource::new(data_url, Handle::current())?;

    let cancel = CancelToken::new();
    let on_interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling after the current batch...");
                cancel.cancel();
            }
        })
    };

    let (outcome, progress_shown) = tokio::task::spawn_blocking(move || {
        let mut progress_shown = false;
        let outcome = svc.sync(&source, &cancel, &mut |p| {
            if !json {
                progress_shown |= print_progress(p);
            }
        });
        (outcome, progress_shown)
    })
    .await
    .context("Sync task failed")?;
    on_interrupt.abort();
    if progress_shown {
        // end the \r progress line
        eprintln!();
    }

    let outcome = outcome?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome {
        SyncOutcome::UpToDate { version } => {
            println!("Catalog is up to date ({}).", format_timestamp(Some(version)));
        }
        SyncOutcome::Updated(report) => {
            println!(
                "Imported {} products from dataset {}.",
                report.imported,
                format_timestamp(Some(report.version))
            );
            if report.tagged > 0 {
                println!("  {} tagged by ingredient analysis", report.tagged);
            }
            if report.skipped > 0 {
                println!("  {} undecodable lines skipped", report.skipped);
            }
        }
    }
    Ok(())
}

/// Returns whether an unterminated `\r` progress line was written.
fn print_progress(p: SyncProgress) -> bool {
    match p.phase {
        SyncPhase::CheckingVersion => eprintln!("Checking for updates..."),
        SyncPhase::Downloading => eprintln!("Downloading dataset..."),
        SyncPhase::Parsing if p.committed > 0 => {
            eprint!("\rImported {} records", p.committed);
            let _ = std::io::stderr().flush();
            return true;
        }
        _ => {}
    }
    false
}
