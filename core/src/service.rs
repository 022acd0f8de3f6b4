use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::classifier::{Classifier, Detection};
use crate::db::ProductStore;
use crate::error::SyncError;
use crate::models::{
    Classification, LookupResult, LookupSource, Product, ScanEntry, StoreStats, SyncOutcome,
};
use crate::sync::{CancelToken, DatasetSource, SyncOptions, SyncPhase, SyncProgress, Synchronizer};

/// Remote single-product lookup, used when a barcode is not in the local
/// catalog.
///
/// The CLI implements this with reqwest against the OpenFoodFacts v2 API.
/// Called synchronously; async callers should go through `spawn_blocking`.
pub trait ProductLookupProvider: Send + Sync {
    fn lookup_barcode(&self, code: &str) -> Result<Option<Product>>;
}

/// Owns the catalog store, the classifier, and the synchronizer, and wires
/// them into the operations the outer surfaces expose.
pub struct CatalogService {
    store: ProductStore,
    classifier: Classifier,
    synchronizer: Synchronizer,
}

impl CatalogService {
    pub fn open(db_path: &Path, options: SyncOptions) -> Result<Self> {
        let store = ProductStore::open(db_path)?;
        Ok(Self::from_parts(store, Classifier::new(), options))
    }

    pub fn open_in_memory(options: SyncOptions) -> Result<Self> {
        let store = ProductStore::open_in_memory()?;
        Ok(Self::from_parts(store, Classifier::new(), options))
    }

    #[must_use]
    pub fn from_parts(store: ProductStore, classifier: Classifier, options: SyncOptions) -> Self {
        Self {
            store,
            classifier,
            synchronizer: Synchronizer::new(options),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ProductStore {
        &self.store
    }

    #[must_use]
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    // --- Sync ---

    /// Run one sync pass against `source`. Rejected with
    /// [`SyncError::AlreadyRunning`] while another pass is in flight.
    pub fn sync(
        &self,
        source: &dyn DatasetSource,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(SyncProgress),
    ) -> Result<SyncOutcome, SyncError> {
        self.synchronizer
            .run(&self.store, source, &self.classifier, cancel, on_progress)
    }

    #[must_use]
    pub fn sync_phase(&self) -> SyncPhase {
        self.synchronizer.phase()
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.synchronizer.is_running()
    }

    // --- Lookups ---

    pub fn get_product(&self, code: &str) -> Result<Option<Product>> {
        self.store
            .get(code.trim())
            .with_context(|| format!("Failed to read product {code}"))
    }

    /// Look up a barcode: local catalog first, then `provider` if given.
    /// Every lookup is recorded in the scan history.
    pub fn lookup(
        &self,
        code: &str,
        provider: Option<&dyn ProductLookupProvider>,
    ) -> Result<LookupResult> {
        let code = code.trim();

        let local = match self.store.get(code) {
            Ok(found) => found,
            Err(e) => {
                warn!("local lookup for {code} failed, trying remote: {e}");
                None
            }
        };

        let (source, product) = match local {
            Some(product) => (LookupSource::Local, Some(product)),
            None => match provider {
                Some(provider) => match provider
                    .lookup_barcode(code)
                    .with_context(|| format!("Remote lookup failed for {code}"))?
                {
                    Some(product) => (LookupSource::Remote, Some(product)),
                    None => (LookupSource::NotFound, None),
                },
                None => (LookupSource::NotFound, None),
            },
        };

        let (classification, detection) = product
            .as_ref()
            .map_or((None, None), |p| self.describe(p));

        if let Err(e) = self
            .store
            .record_scan(code, product.as_ref(), classification)
        {
            warn!("failed to record scan of {code}: {e}");
        }
        info!(code, source = ?source, status = ?classification, "lookup");

        Ok(LookupResult {
            code: code.to_string(),
            source,
            product,
            classification,
            detection,
        })
    }

    /// Classification of a product, plus the text detection when that is
    /// what decided it. `None` when the record has no tags and no
    /// ingredient text.
    #[must_use]
    pub fn describe(&self, product: &Product) -> (Option<Classification>, Option<Detection>) {
        if !product.has_palm_evidence() {
            return (None, None);
        }
        let classification = product.classification(&self.classifier);
        if !product.palm_oil_tags.is_empty() {
            return (Some(classification), None);
        }
        let detection = self.classifier.classify(product.ingredients.as_deref());
        (Some(classification), detection.detected().then_some(detection))
    }

    /// Classify free ingredient text. Text alone can only confirm or clear.
    #[must_use]
    pub fn classify_text(&self, text: &str) -> (Classification, Detection) {
        let detection = self.classifier.classify(Some(text));
        let classification = if detection.detected() {
            Classification::Confirmed
        } else {
            Classification::None
        };
        (classification, detection)
    }

    // --- Catalog state ---

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats().context("Failed to read catalog stats")
    }

    pub fn recent_scans(&self, limit: i64) -> Result<Vec<ScanEntry>> {
        self.store
            .recent_scans(limit)
            .context("Failed to read scan history")
    }
}
