use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;

use foodscan_core::models::Product;
use foodscan_core::openfoodfacts::{PRODUCT_FIELDS, ProductResponse, product_from_remote};
use foodscan_core::service::ProductLookupProvider;

const PRODUCT_URL: &str = "https://world.openfoodfacts.org/api/v2/product";

pub struct OpenFoodFactsClient {
    client: reqwest::Client,
    rt: tokio::runtime::Handle,
}

impl OpenFoodFactsClient {
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "foodscan/{} (palm oil scanner)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            rt: tokio::runtime::Handle::current(),
        })
    }

    pub async fn lookup_barcode_async(&self, code: &str) -> Result<Option<Product>> {
        let url = format!("{PRODUCT_URL}/{code}");
        let resp = self
            .client
            .get(&url)
            .query(&[("fields", PRODUCT_FIELDS)])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .context("Failed to reach OpenFoodFacts API")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("OpenFoodFacts API error: {}", resp.status());
        }

        let data: ProductResponse = resp
            .json()
            .await
            .context("Failed to parse OpenFoodFacts product response")?;

        Ok(into_product(code, data))
    }
}

fn into_product(code: &str, data: ProductResponse) -> Option<Product> {
    if !data.is_found() {
        return None;
    }
    let code = data
        .code
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or(code)
        .trim()
        .to_string();
    data.product.map(|p| product_from_remote(&code, p))
}

/// Blocking bridge; call from a `spawn_blocking` thread, never from an async
/// task.
impl ProductLookupProvider for OpenFoodFactsClient {
    fn lookup_barcode(&self, code: &str) -> Result<Option<Product>> {
        self.rt.block_on(self.lookup_barcode_async(code))
    }
}
