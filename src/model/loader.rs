use std::{io::Write, path::PathBuf, sync::Arc};

use axum::body::Bytes;
use tokio::task;
use tracing::{debug, info, warn};

use crate::{
    error::ModelError,
    format::{FormatTag, extension_of, url_extension},
    model::{LoadOptions, ModelAdapter, RuntimeRegistry},
    remote::RemoteClient,
};

/// Where a model artifact comes from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    Upload { filename: String, bytes: Bytes },
    Url(String),
}

impl ModelSource {
    pub fn extension(&self) -> String {
        match self {
            ModelSource::Upload { filename, .. } => extension_of(filename),
            ModelSource::Url(url) => url_extension(url),
        }
    }
}

pub struct ModelLoader {
    runtimes: Arc<RuntimeRegistry>,
    remote: Arc<dyn RemoteClient>,
    temp_dir: Option<PathBuf>,
    seed: u64,
}

impl ModelLoader {
    pub fn new(
        runtimes: Arc<RuntimeRegistry>,
        remote: Arc<dyn RemoteClient>,
        temp_dir: Option<PathBuf>,
        seed: u64,
    ) -> Self {
        Self {
            runtimes,
            remote,
            temp_dir,
            seed,
        }
    }

    /// Resolves `source` into an adapted model.
    ///
    /// The artifact only lives on disk for the duration of the runtime's
    /// `load` call; the temp file is removed on every exit path.
    pub async fn load(&self, source: ModelSource) -> Result<ModelAdapter, ModelError> {
        let ext = source.extension();
        let format = match FormatTag::from_extension(&ext) {
            Some(format @ (FormatTag::Pickle | FormatTag::Hdf5)) => format,
            Some(FormatTag::Csv | FormatTag::Json | FormatTag::Npy) | None => {
                return Err(ModelError::UnsupportedModelFormat(ext));
            }
        };
        // weights only; training configuration is never restored
        let options = LoadOptions { compile: false };

        let bytes = match source {
            ModelSource::Upload { filename, bytes } => {
                debug!(%filename, size = bytes.len(), "processing uploaded model");
                bytes
            }
            ModelSource::Url(url) => {
                debug!(%url, "processing model from URL");
                self.remote
                    .fetch(&url)
                    .await
                    .map_err(|err| ModelError::ModelFetch {
                        url: url.clone(),
                        reason: format!("{err:#}"),
                    })?
                    .bytes
            }
        };

        let runtime = self.runtimes.get(format).ok_or_else(|| {
            ModelError::ModelLoad(format!("no runtime registered for {format} models"))
        })?;

        let temp = self.persist(&ext, &bytes)?;
        info!(%format, runtime = runtime.name(), "loading model");

        let seed = self.seed;
        task::spawn_blocking(move || {
            let loaded = runtime.load(temp.path(), options);
            drop(temp);
            let adapter = ModelAdapter::new(
                loaded.map_err(|err| ModelError::ModelLoad(format!("{err:#}")))?,
            );
            if adapter.is_forecaster() {
                adapter.smoke_test(seed)?;
            }
            Ok::<_, ModelError>(adapter)
        })
        .await
        .map_err(|err| ModelError::ModelLoad(format!("model loading task failed: {err}")))?
        .inspect_err(|err| warn!(error = %err, "failed to load model"))
    }

    fn persist(&self, ext: &str, bytes: &[u8]) -> Result<tempfile::NamedTempFile, ModelError> {
        let suffix = format!(".{ext}");
        let mut builder = tempfile::Builder::new();
        builder.prefix("model-").suffix(&suffix);
        let mut file = match self.temp_dir.as_ref() {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|err| ModelError::ModelLoad(format!("creating temp file: {err}")))?;

        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|err| ModelError::ModelLoad(format!("writing temp file: {err}")))?;
        debug!(path = %file.path().display(), size = bytes.len(), "persisted model artifact");
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::runtime::tests::linear_pickle;
    use crate::model::{Estimator, ModelRuntime, Predict};
    use crate::remote::FetchedResource;
    use async_trait::async_trait;
    use ndarray::array;
    use parking_lot::Mutex;
    use std::path::Path;

    struct StubRemote {
        body: Option<Vec<u8>>,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteClient for StubRemote {
        async fn fetch(&self, url: &str) -> anyhow::Result<FetchedResource> {
            self.fetched.lock().push(url.to_string());
            match &self.body {
                Some(body) => Ok(FetchedResource {
                    bytes: Bytes::from(body.clone()),
                    content_type: None,
                }),
                None => anyhow::bail!("connection refused"),
            }
        }

        async fn publish(&self, _url: &str, _payload: &serde_json::Value) -> bool {
            true
        }
    }

    /// Remembers the path it was handed, then fails.
    struct FailingRuntime {
        seen: Arc<Mutex<Option<PathBuf>>>,
    }

    impl ModelRuntime for FailingRuntime {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn load(&self, path: &Path, options: LoadOptions) -> anyhow::Result<Box<dyn Estimator>> {
            assert!(path.exists());
            assert!(!options.compile);
            *self.seen.lock() = Some(path.to_path_buf());
            anyhow::bail!("corrupt weights")
        }
    }

    fn loader(remote: StubRemote, registry: RuntimeRegistry) -> (ModelLoader, Arc<StubRemote>) {
        let remote = Arc::new(remote);
        let loader = ModelLoader::new(Arc::new(registry), remote.clone(), None, 21);
        (loader, remote)
    }

    fn loader_in(dir: &Path) -> ModelLoader {
        ModelLoader::new(
            Arc::new(RuntimeRegistry::with_defaults()),
            Arc::new(stub(None)),
            Some(dir.to_path_buf()),
            21,
        )
    }

    fn is_empty_dir(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    fn stub(body: Option<Vec<u8>>) -> StubRemote {
        StubRemote {
            body,
            fetched: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn loads_uploaded_pickle() {
        let (loader, _) = loader(stub(None), RuntimeRegistry::with_defaults());
        let model = loader
            .load(ModelSource::Upload {
                filename: "model.PKL".into(),
                bytes: Bytes::from(linear_pickle(&[7.0, -3.0, 4.0], 0.0, &[])),
            })
            .await
            .unwrap();
        assert_eq!(model.predict(array![[1.0, 1.0, 1.0]].view()).unwrap(), array![8.0]);
    }

    #[tokio::test]
    async fn loads_pickle_from_url() {
        let body = linear_pickle(&[1.0], 0.0, &[]);
        let (loader, remote) = loader(stub(Some(body)), RuntimeRegistry::with_defaults());
        loader
            .load(ModelSource::Url("https://models.test/m.pkl?v=2".into()))
            .await
            .unwrap();
        assert_eq!(remote.fetched.lock().len(), 1);
    }

    #[tokio::test]
    async fn rejects_unsupported_extension_before_fetching() {
        let (loader, remote) = loader(stub(Some(vec![1, 2, 3])), RuntimeRegistry::with_defaults());
        let err = loader
            .load(ModelSource::Url("https://evil.test/payload.exe".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedModelFormat(ref ext) if ext == "exe"));
        assert!(remote.fetched.lock().is_empty());
    }

    #[tokio::test]
    async fn data_extensions_are_not_models() {
        let (loader, _) = loader(stub(None), RuntimeRegistry::with_defaults());
        let err = loader
            .load(ModelSource::Upload {
                filename: "table.csv".into(),
                bytes: Bytes::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedModelFormat(ref ext) if ext == "csv"));
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_with_cause() {
        let (loader, _) = loader(stub(None), RuntimeRegistry::with_defaults());
        let err = loader
            .load(ModelSource::Url("https://down.test/m.pkl".into()))
            .await
            .unwrap_err();
        match err {
            ModelError::ModelFetch { url, reason } => {
                assert_eq!(url, "https://down.test/m.pkl");
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn temp_file_is_removed_when_loading_fails() {
        let seen = Arc::new(Mutex::new(None));
        let registry = RuntimeRegistry::empty();
        registry.register(FormatTag::Hdf5, Arc::new(FailingRuntime { seen: seen.clone() }));
        let (loader, _) = loader(stub(None), registry);

        let err = loader
            .load(ModelSource::Upload {
                filename: "net.keras".into(),
                bytes: Bytes::from_static(b"not really hdf5"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::ModelLoad(ref msg) if msg.contains("corrupt weights")));

        let path = seen.lock().clone().unwrap();
        assert!(path.to_string_lossy().ends_with(".keras"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn temp_file_is_removed_after_successful_load() {
        let dir = tempfile::tempdir().unwrap();
        let model = loader_in(dir.path())
            .load(ModelSource::Upload {
                filename: "model.pkl".into(),
                bytes: Bytes::from(linear_pickle(&[2.0], 1.0, &[])),
            })
            .await
            .unwrap();

        assert_eq!(model.predict(array![[1.0]].view()).unwrap(), array![3.0]);
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn temp_file_is_removed_when_smoke_test_fails() {
        use serde_pickle::Value;
        let dir = tempfile::tempdir().unwrap();
        let bytes = linear_pickle(
            &[1.0, 2.0],
            0.0,
            &[("model_type", Value::String("CatBoostModel".into()))],
        );

        let err = loader_in(dir.path())
            .load(ModelSource::Upload {
                filename: "ts.pkl".into(),
                bytes: Bytes::from(bytes),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::ModelLoad(_)));
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn missing_runtime_is_a_load_error() {
        let (loader, _) = loader(stub(None), RuntimeRegistry::with_defaults());
        let err = loader
            .load(ModelSource::Upload {
                filename: "net.h5".into(),
                bytes: Bytes::from_static(b"\x89HDF"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::ModelLoad(_)));
    }

    #[tokio::test]
    async fn forecasters_are_smoke_tested() {
        use serde_pickle::Value;
        // three coefficients cannot serve the eleven-covariate window
        let bytes = linear_pickle(
            &[1.0, 2.0, 3.0],
            0.0,
            &[("model_type", Value::String("CatBoostModel".into()))],
        );
        let (loader, _) = loader(stub(None), RuntimeRegistry::with_defaults());
        let err = loader
            .load(ModelSource::Upload {
                filename: "ts.pkl".into(),
                bytes: Bytes::from(bytes),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::ModelLoad(ref msg) if msg.contains("test prediction failed")));
    }
}
