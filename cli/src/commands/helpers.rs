use chrono::{DateTime, Local};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use foodscan_core::models::{Classification, Product, ScanEntry};

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

/// Epoch milliseconds as local time; "-" when absent or out of range.
pub(crate) fn format_timestamp(ms: Option<i64>) -> String {
    ms.filter(|&ms| ms > 0)
        .and_then(DateTime::from_timestamp_millis)
        .map_or_else(
            || "-".to_string(),
            |dt| {
                dt.with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M")
                    .to_string()
            },
        )
}

pub(crate) fn status_marker(status: Option<Classification>) -> &'static str {
    match status {
        Some(Classification::Confirmed) => "RED",
        Some(Classification::Possible) => "YELLOW",
        Some(Classification::None) => "GREEN",
        None => "-",
    }
}

pub(crate) fn status_label(status: Option<Classification>) -> &'static str {
    status.map_or("Palm Oil Status Unknown", Classification::label)
}

pub(crate) fn print_product(product: &Product, classification: Option<Classification>) {
    let name = product.name.as_deref().unwrap_or("(unnamed)");
    println!("{name} [{}]", product.code);
    println!(
        "  {} ({})",
        status_label(classification),
        status_marker(classification)
    );
    if !product.palm_oil_tags.is_empty() {
        println!("  Palm oil: {}", join(&product.palm_oil_tags));
    }
    if !product.palm_oil_may_be_tags.is_empty() {
        println!("  May contain: {}", join(&product.palm_oil_may_be_tags));
    }
    if let Some(ingredients) = &product.ingredients {
        println!("  Ingredients: {}", truncate(ingredients, 200));
    }
    let grade = product
        .nutriscore_grade
        .as_deref()
        .map_or_else(|| "-".to_string(), str::to_uppercase);
    let nova = product
        .nova_group
        .map_or_else(|| "-".to_string(), |n| n.to_string());
    println!("  Nutri-Score: {grade}  NOVA: {nova}");
    if !product.nutrient_levels.is_empty() {
        let levels: Vec<String> = product
            .nutrient_levels
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        println!("  Levels: {}", levels.join(", "));
    }
    if !product.additives_tags.is_empty() {
        println!("  Additives: {}", join(&product.additives_tags));
    }
    if let Some(url) = product.display_image_url() {
        println!("  Image: {url}");
    }
}

fn join<'a>(tags: impl IntoIterator<Item = &'a String>) -> String {
    tags.into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn print_scan_table(scans: &[ScanEntry]) {
    #[derive(Tabled)]
    struct ScanRow {
        #[tabled(rename = "Scanned")]
        scanned: String,
        #[tabled(rename = "Code")]
        code: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Status")]
        status: String,
    }

    let rows: Vec<ScanRow> = scans
        .iter()
        .map(|s| ScanRow {
            scanned: format_timestamp(Some(s.scanned_at)),
            code: s.code.clone(),
            name: if s.found {
                s.product_name
                    .as_deref()
                    .map(|n| truncate(n, 35))
                    .unwrap_or_default()
            } else {
                "(not found)".to_string()
            },
            status: status_marker(s.status).to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..4)).with(Alignment::center()))
        .to_string();
    println!("{table}");
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_label_unknown() {
        assert_eq!(status_label(None), "Palm Oil Status Unknown");
        assert_eq!(status_marker(None), "-");
        assert_eq!(
            status_label(Some(Classification::None)),
            "No Palm Oil Detected"
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world this is long", 10), "hello w...");
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate("Crème fraîche", 10), "Crème f...");
        assert_eq!(truncate("Palmöl", 10), "Palmöl");
    }

    #[test]
    fn test_format_timestamp_absent() {
        assert_eq!(format_timestamp(None), "-");
        assert_eq!(format_timestamp(Some(0)), "-");
        assert_ne!(format_timestamp(Some(1_768_900_000_000)), "-");
    }

    #[test]
    fn test_status_marker() {
        assert_eq!(status_marker(Some(Classification::Confirmed)), "RED");
        assert_eq!(status_marker(Some(Classification::Possible)), "YELLOW");
        assert_eq!(status_marker(Some(Classification::None)), "GREEN");
        assert_eq!(status_marker(None), "-");
    }

    #[test]
    fn test_json_error() {
        assert_eq!(json_error("boom"), r#"{"error":"boom"}"#);
    }
}
