// Model handle cache
// Loads each model source at most once per process and hands out shared handles

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::events::backend::DetectorError;
use crate::events::model::DrumModel;

/// Where a model artifact lives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelSource {
    Url(String),
    Path(PathBuf),
}

impl ModelSource {
    /// `http://` and `https://` strings are URLs; anything else is a local path
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ModelSource::Url(trimmed.to_string())
        } else {
            ModelSource::Path(PathBuf::from(trimmed))
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Url(url) => f.write_str(url),
            ModelSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Turns a model source into a loaded model. Called on a blocking thread.
pub trait ModelLoader: Send + Sync {
    fn load(&self, source: &ModelSource) -> Result<Arc<dyn DrumModel>, DetectorError>;
}

/// Loader for builds without an inference runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedLoader;

impl ModelLoader for UnsupportedLoader {
    fn load(&self, source: &ModelSource) -> Result<Arc<dyn DrumModel>, DetectorError> {
        Err(DetectorError::ModelUnavailable(format!(
            "cannot load {}: built without the `onnx` feature",
            source
        )))
    }
}

/// The loader matching this build's features
pub fn default_loader() -> Arc<dyn ModelLoader> {
    #[cfg(feature = "onnx")]
    {
        Arc::new(crate::events::onnx::OnnxLoader::default())
    }
    #[cfg(not(feature = "onnx"))]
    {
        Arc::new(UnsupportedLoader)
    }
}

type ModelCell = Arc<OnceCell<Arc<dyn DrumModel>>>;

/// Process-wide model cache keyed by source.
///
/// Concurrent requests for the same source share one load; a failed load is
/// not cached, so the next request retries.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    cells: Mutex<HashMap<ModelSource, ModelCell>>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        ModelCache {
            loader,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_loader() -> Self {
        Self::new(default_loader())
    }

    fn cell(&self, source: &ModelSource) -> ModelCell {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cells.entry(source.clone()).or_default())
    }

    /// Return the cached model for `source`, loading it if needed
    pub async fn get_or_load(&self, source: &ModelSource) -> Result<Arc<dyn DrumModel>, DetectorError> {
        let cell = self.cell(source);
        let loader = Arc::clone(&self.loader);
        let owned = source.clone();

        let model = cell
            .get_or_try_init(|| async move {
                log::info!("Loading model from {}", owned);
                tokio::task::spawn_blocking(move || loader.load(&owned))
                    .await
                    .map_err(|e| DetectorError::ModelUnavailable(format!("model loader failed: {e}")))?
            })
            .await?;

        Ok(Arc::clone(model))
    }

    /// Whether a loaded model is held for `source`
    pub fn is_cached(&self, source: &ModelSource) -> bool {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(source).is_some_and(|cell| cell.initialized())
    }

    /// Drop the handle for `source` so the next request reloads it.
    /// Returns true if a loaded model was dropped.
    pub fn invalidate(&self, source: &ModelSource) -> bool {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = cells
            .remove(source)
            .is_some_and(|cell| cell.initialized());
        if dropped {
            log::info!("Invalidated cached model {}", source);
        }
        dropped
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::with_default_loader()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::model::tests::ScriptedModel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Loader that counts calls and optionally fails
    pub(crate) struct CountingLoader {
        pub loads: AtomicUsize,
        pub fail: bool,
        pub delay: Duration,
    }

    impl CountingLoader {
        pub fn ok() -> Self {
            CountingLoader {
                loads: AtomicUsize::new(0),
                fail: false,
                delay: Duration::from_millis(0),
            }
        }

        pub fn failing() -> Self {
            CountingLoader {
                fail: true,
                ..Self::ok()
            }
        }
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, source: &ModelSource) -> Result<Arc<dyn DrumModel>, DetectorError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(DetectorError::ModelUnavailable(format!("no model at {}", source)));
            }
            Ok(Arc::new(ScriptedModel::new(vec![])))
        }
    }

    #[test]
    fn test_parse_source() {
        assert_eq!(
            ModelSource::parse("https://models.example/drums.onnx"),
            ModelSource::Url("https://models.example/drums.onnx".into())
        );
        assert_eq!(
            ModelSource::parse("HTTP://host/m.onnx"),
            ModelSource::Url("HTTP://host/m.onnx".into())
        );
        assert_eq!(
            ModelSource::parse("./models/drums.onnx"),
            ModelSource::Path(PathBuf::from("./models/drums.onnx"))
        );
        assert_eq!(ModelSource::parse("/m.onnx").to_string(), "/m.onnx");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_load() {
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_millis(50),
            ..CountingLoader::ok()
        });
        let cache = Arc::new(ModelCache::new(loader.clone()));
        let source = ModelSource::parse("/models/drums.onnx");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let source = source.clone();
                tokio::spawn(async move { cache.get_or_load(&source).await.is_ok() })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(cache.is_cached(&source));
    }

    #[tokio::test]
    async fn test_distinct_sources_load_separately() {
        let loader = Arc::new(CountingLoader::ok());
        let cache = ModelCache::new(loader.clone());

        cache.get_or_load(&ModelSource::parse("/a.onnx")).await.unwrap();
        cache.get_or_load(&ModelSource::parse("/b.onnx")).await.unwrap();
        cache.get_or_load(&ModelSource::parse("/a.onnx")).await.unwrap();

        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let loader = Arc::new(CountingLoader::failing());
        let cache = ModelCache::new(loader.clone());
        let source = ModelSource::parse("/missing.onnx");

        assert!(cache.get_or_load(&source).await.is_err());
        assert!(!cache.is_cached(&source));
        assert!(cache.get_or_load(&source).await.is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let loader = Arc::new(CountingLoader::ok());
        let cache = ModelCache::new(loader.clone());
        let source = ModelSource::parse("/drums.onnx");

        cache.get_or_load(&source).await.unwrap();
        assert!(cache.invalidate(&source));
        assert!(!cache.is_cached(&source));
        assert!(!cache.invalidate(&source));

        cache.get_or_load(&source).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[cfg(not(feature = "onnx"))]
    #[tokio::test]
    async fn test_default_loader_reports_unavailable() {
        let cache = ModelCache::with_default_loader();
        let result = cache.get_or_load(&ModelSource::parse("/drums.onnx")).await;
        assert!(matches!(result, Err(DetectorError::ModelUnavailable(_))));
    }
}
