use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::debug;

use foodscan_core::error::SyncError;
use foodscan_core::sync::{ChunkStream, DatasetSource};

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const VERSION_FILE: &str = "version.json";
pub const EXPORT_FILE: &str = "products.jsonl.gz";

#[derive(Debug, Deserialize)]
struct VersionDocument {
    last_updated: i64,
}

/// Published dataset served over HTTP: `{base}/version.json` and
/// `{base}/products.jsonl.gz`.
///
/// Timeouts cover the version request and the download handshake only. The
/// body streams for as long as it keeps making progress.
pub struct HttpDatasetSource {
    client: reqwest::Client,
    base_url: String,
    rt: Handle,
}

impl HttpDatasetSource {
    pub fn new(base_url: &str, rt: Handle) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("foodscan/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rt,
        })
    }

    async fn fetch_version(&self) -> Result<i64, SyncError> {
        let url = format!("{}/{VERSION_FILE}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("t", Utc::now().timestamp_millis())])
            .timeout(VERSION_TIMEOUT)
            .send()
            .await
            .map_err(|e| SyncError::VersionCheckFailed(format!("{url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(SyncError::VersionCheckFailed(format!(
                "{url}: HTTP {}",
                resp.status()
            )));
        }

        // Static hosts often answer missing files with an HTML page.
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.contains("application/json") {
            return Err(SyncError::VersionCheckFailed(format!(
                "{url}: unexpected content type '{content_type}'"
            )));
        }

        let doc: VersionDocument = resp
            .json()
            .await
            .map_err(|e| SyncError::VersionCheckFailed(format!("{url}: {e}")))?;
        if doc.last_updated <= 0 {
            return Err(SyncError::VersionCheckFailed(format!(
                "{url}: invalid last_updated {}",
                doc.last_updated
            )));
        }
        Ok(doc.last_updated)
    }

    async fn start_download(&self) -> Result<reqwest::Response, SyncError> {
        let url = format!("{}/{EXPORT_FILE}", self.base_url);
        let resp = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.client.get(&url).send())
            .await
            .map_err(|_| SyncError::DownloadFailed(format!("{url}: no response within {HANDSHAKE_TIMEOUT:?}")))?
            .map_err(|e| SyncError::DownloadFailed(format!("{url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(SyncError::DownloadFailed(format!(
                "{url}: HTTP {}",
                resp.status()
            )));
        }
        debug!(content_length = ?resp.content_length(), "export download started");
        Ok(resp)
    }
}

impl DatasetSource for HttpDatasetSource {
    fn remote_version(&self) -> Result<i64, SyncError> {
        self.rt.block_on(self.fetch_version())
    }

    fn open_export(&self) -> Result<ChunkStream<'_>, SyncError> {
        let response = self.rt.block_on(self.start_download())?;
        Ok(Box::new(ResponseChunks {
            response: Some(response),
            rt: self.rt.clone(),
        }))
    }
}

/// Pulls body chunks one at a time as the synchronizer asks for them.
struct ResponseChunks {
    response: Option<reqwest::Response>,
    rt: Handle,
}

impl Iterator for ResponseChunks {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let response = self.response.as_mut()?;
        match self.rt.block_on(response.chunk()) {
            Ok(Some(bytes)) => Some(Ok(bytes.to_vec())),
            Ok(None) => {
                self.response = None;
                None
            }
            Err(e) => {
                self.response = None;
                Some(Err(io::Error::other(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::header;
    use axum::response::{Html, IntoResponse};
    use axum::routing::get;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use foodscan_core::models::SyncOutcome;
    use foodscan_core::service::CatalogService;
    use foodscan_core::sync::{CancelToken, SyncOptions};
    use std::io::Write;

    fn export_payload() -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        for i in 0..1200 {
            writeln!(
                enc,
                r#"{{"c":"{i:013}","n":"Item {i}","i":"Vegetable fat (palm), salt","l":1768900000000}}"#
            )
            .unwrap();
        }
        enc.finish().unwrap()
    }

    /// Serves a dataset under `/data` and a broken one under `/html`.
    fn spawn_server(rt: &tokio::runtime::Runtime) -> String {
        let payload = export_payload();
        let app = Router::new()
            .route(
                "/data/version.json",
                get(|| async {
                    axum::Json(serde_json::json!({ "last_updated": 1_768_900_000_000_i64 }))
                }),
            )
            .route(
                "/data/products.jsonl.gz",
                get(move || {
                    let payload = payload.clone();
                    async move {
                        ([(header::CONTENT_TYPE, "application/gzip")], payload).into_response()
                    }
                }),
            )
            .route(
                "/html/version.json",
                get(|| async { Html("<!doctype html><title>app</title>") }),
            );

        let listener = rt
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        rt.spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_version_check() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let base = spawn_server(&rt);

        let source = HttpDatasetSource::new(&format!("{base}/data/"), rt.handle().clone()).unwrap();
        assert_eq!(source.remote_version().unwrap(), 1_768_900_000_000);

        let html = HttpDatasetSource::new(&format!("{base}/html"), rt.handle().clone()).unwrap();
        assert!(matches!(
            html.remote_version(),
            Err(SyncError::VersionCheckFailed(_))
        ));

        let missing = HttpDatasetSource::new(&format!("{base}/nope"), rt.handle().clone()).unwrap();
        assert!(matches!(
            missing.remote_version(),
            Err(SyncError::VersionCheckFailed(_))
        ));
        assert!(matches!(
            missing.open_export().map(|_| ()),
            Err(SyncError::DownloadFailed(_))
        ));
    }

    #[test]
    fn test_sync_over_http() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let base = spawn_server(&rt);
        let source = HttpDatasetSource::new(&format!("{base}/data"), rt.handle().clone()).unwrap();
        let svc = CatalogService::open_in_memory(SyncOptions::default()).unwrap();

        let outcome = svc
            .sync(&source, &CancelToken::new(), &mut |_| {})
            .unwrap();
        let SyncOutcome::Updated(report) = outcome else {
            panic!("expected an update");
        };
        assert_eq!(report.imported, 1200);
        assert_eq!(report.tagged, 1200);
        assert_eq!(svc.stats().unwrap().version_marker, Some(1_768_900_000_000));

        let again = svc
            .sync(&source, &CancelToken::new(), &mut |_| {})
            .unwrap();
        assert_eq!(
            again,
            SyncOutcome::UpToDate {
                version: 1_768_900_000_000
            }
        );
    }
}
