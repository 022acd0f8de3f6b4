use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use foodscan_core::classifier::{Detection, MatchPass};
use foodscan_core::models::{Classification, LookupSource};
use foodscan_core::service::{CatalogService, ProductLookupProvider};

use super::helpers::{json_error, print_product, status_marker};
use crate::openfoodfacts::OpenFoodFactsClient;

pub(crate) async fn cmd_lookup(
    svc: Arc<CatalogService>,
    code: &str,
    offline: bool,
    json: bool,
) -> Result<()> {
    let off = if offline {
        None
    } else {
        Some(OpenFoodFactsClient::new()?)
    };
    let query = code.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let provider = off.as_ref().map(|c| c as &dyn ProductLookupProvider);
        svc.lookup(&query, provider)
    })
    .await
    .context("Lookup task failed")??;

    let Some(product) = &result.product else {
        if json {
            println!(
                "{}",
                json_error(&format!("No product found for barcode {}", result.code))
            );
        } else {
            eprintln!("No product found for barcode {}", result.code);
        }
        process::exit(2);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    print_product(product, result.classification);
    if let Some(detection) = &result.detection {
        println!("  Detected by: {}", describe_detection(detection));
    }
    match result.source {
        LookupSource::Local => println!("  Source: local catalog"),
        LookupSource::Remote => println!("  Source: OpenFoodFacts (not in local catalog)"),
        LookupSource::NotFound => {}
    }
    Ok(())
}

pub(crate) fn cmd_classify(svc: &CatalogService, text: &str, json: bool) -> Result<()> {
    #[derive(Serialize)]
    struct ClassifyOutput<'a> {
        classification: Classification,
        detection: &'a Detection,
    }

    let (classification, detection) = svc.classify_text(text);
    if json {
        let out = ClassifyOutput {
            classification,
            detection: &detection,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "{} ({})",
        classification.label(),
        status_marker(Some(classification))
    );
    if detection.detected() {
        println!("  Detected by: {}", describe_detection(&detection));
    }
    Ok(())
}

fn describe_detection(detection: &Detection) -> String {
    match (detection.pass, detection.phrase.as_deref()) {
        (Some(MatchPass::Variant), Some(phrase)) => format!("ingredient name \"{phrase}\""),
        (Some(MatchPass::Variant), None) => "ingredient name".to_string(),
        (Some(MatchPass::Context), _) => "bracketed palm after a fat/oil keyword".to_string(),
        (None, _) => "-".to_string(),
    }
}
