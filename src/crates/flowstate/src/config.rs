//! Storage settings
//!
//! Settings are read from a YAML or JSON file (chosen by extension), then
//! overlaid with `FLOWSTATE_*` environment variables and validated. Secrets
//! never live in the file: the integrity key is read from the environment
//! variable the settings name, base64 encoded.
//!
//! ```yaml
//! backend: durable
//! database_url: "sqlite:states.db"
//! table_name: flowstates
//! transforms:
//!   compression: fast
//!   integrity_key_env: FLOWSTATE_SIGNING_KEY
//! ```
//!
//! | Variable                        | Field                           |
//! |---------------------------------|---------------------------------|
//! | `FLOWSTATE_BACKEND`             | `backend`                       |
//! | `FLOWSTATE_MAX_STATES`          | `max_states`                    |
//! | `FLOWSTATE_KEY_POLICY`          | `key_policy`                    |
//! | `FLOWSTATE_ON_COLLISION`        | `on_collision`                  |
//! | `FLOWSTATE_DATABASE_URL`        | `database_url`                  |
//! | `FLOWSTATE_TABLE_NAME`          | `table_name`                    |
//! | `FLOWSTATE_COMPRESSION`         | `transforms.compression`        |
//! | `FLOWSTATE_INTEGRITY_KEY_ENV`   | `transforms.integrity_key_env`  |
//! | `FLOWSTATE_MAX_CHECKPOINT_BYTES`| `max_checkpoint_bytes`          |

use crate::codec::{CheckpointCodec, DEFAULT_SIZE_LIMIT};
use crate::engine::Engine;
use crate::error::{CheckpointError, Result};
use crate::fingerprint::{FingerprintCache, FingerprintVerifier, DEFAULT_CACHE_CAPACITY};
use crate::id::{ContentIdGenerator, IdGenerator, RandomIdGenerator};
use crate::index::FunctionIndex;
use crate::registry::ReferenceRegistry;
use crate::scripts::{ScriptCompiler, ScriptRepository};
use crate::store::{
    CheckpointStore, CollisionPolicy, DurableStore, SessionStore, TokenStore, DEFAULT_MAX_STATES,
    DEFAULT_TABLE,
};
use crate::transform::{
    Compression, CompressionLevel, Integrity, Pipeline, Pooled, Transform, ENVELOPE_ALLOWANCE,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ENV_PREFIX: &str = "FLOWSTATE_";

/// Where checkpoints are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Session,
    Durable,
    ClientSide,
}

/// How session store keys are generated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    #[default]
    Random,
    ContentDerived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSettings {
    /// Compress checkpoints at this level; no compression when absent
    pub compression: Option<CompressionLevel>,
    /// Environment variable holding the base64 HMAC key; no integrity
    /// transform when absent
    pub integrity_key_env: Option<String>,
    /// Reuse coder instances across calls
    pub pooled: bool,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            compression: None,
            integrity_key_env: None,
            pooled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    pub root: Option<PathBuf>,
    pub prefix: String,
    pub stale_check_ms: u64,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            root: None,
            prefix: String::new(),
            stale_check_ms: 10_000,
        }
    }
}

/// Settings for the checkpoint subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: Backend,
    /// Per-scope capacity of the session store
    pub max_states: usize,
    pub key_policy: KeyPolicy,
    pub on_collision: CollisionPolicy,
    pub database_url: Option<String>,
    pub table_name: String,
    pub max_connections: u32,
    pub transforms: TransformSettings,
    pub fingerprint_cache_capacity: usize,
    /// Upper bound for a serialized checkpoint, and for what a compressed
    /// store entry may inflate to
    pub max_checkpoint_bytes: u64,
    pub scripts: ScriptSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            max_states: DEFAULT_MAX_STATES,
            key_policy: KeyPolicy::default(),
            on_collision: CollisionPolicy::default(),
            database_url: None,
            table_name: DEFAULT_TABLE.to_string(),
            max_connections: 5,
            transforms: TransformSettings::default(),
            fingerprint_cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_checkpoint_bytes: DEFAULT_SIZE_LIMIT,
            scripts: ScriptSettings::default(),
        }
    }
}

/// Load a YAML or JSON file, choosing the format by extension
pub fn load_config_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .ok_or_else(|| {
            CheckpointError::Config(format!("Unable to determine file extension for {:?}", path))
        })?;
    let content = std::fs::read_to_string(path)?;
    match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| {
            CheckpointError::Config(format!("Failed to parse YAML config from {:?}: {}", path, e))
        }),
        "json" => serde_json::from_str(&content).map_err(|e| {
            CheckpointError::Config(format!("Failed to parse JSON config from {:?}: {}", path, e))
        }),
        other => Err(CheckpointError::Config(format!(
            "Unsupported config file extension: {}",
            other
        ))),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|value| !value.is_empty())
}

fn parse_env<T: DeserializeOwned>(name: &str) -> Result<Option<T>> {
    env_var(name)
        .map(|value| {
            serde_yaml::from_str(&value).map_err(|e| {
                CheckpointError::Config(format!(
                    "Failed to parse environment variable '{}{}': {}",
                    ENV_PREFIX, name, e
                ))
            })
        })
        .transpose()
}

impl StorageSettings {
    /// Read a settings file without environment overlay
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_config_file(path)
    }

    /// Read a settings file, apply the environment overlay and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut settings = Self::from_file(path)?;
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Override fields from `FLOWSTATE_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(backend) = parse_env("BACKEND")? {
            self.backend = backend;
        }
        if let Some(max_states) = parse_env("MAX_STATES")? {
            self.max_states = max_states;
        }
        if let Some(policy) = parse_env("KEY_POLICY")? {
            self.key_policy = policy;
        }
        if let Some(policy) = parse_env("ON_COLLISION")? {
            self.on_collision = policy;
        }
        if let Some(url) = env_var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(table) = env_var("TABLE_NAME") {
            self.table_name = table;
        }
        if let Some(level) = parse_env("COMPRESSION")? {
            self.transforms.compression = Some(level);
        }
        if let Some(var) = env_var("INTEGRITY_KEY_ENV") {
            self.transforms.integrity_key_env = Some(var);
        }
        if let Some(limit) = parse_env("MAX_CHECKPOINT_BYTES")? {
            self.max_checkpoint_bytes = limit;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_states == 0 {
            return Err(CheckpointError::Config(
                "max_states must be greater than zero".to_string(),
            ));
        }
        if self.max_checkpoint_bytes == 0 {
            return Err(CheckpointError::Config(
                "max_checkpoint_bytes must be greater than zero".to_string(),
            ));
        }
        if self.fingerprint_cache_capacity == 0 {
            return Err(CheckpointError::Config(
                "fingerprint_cache_capacity must be greater than zero".to_string(),
            ));
        }
        if self.backend == Backend::Durable {
            if self.database_url.is_none() {
                return Err(CheckpointError::Config(
                    "durable backend requires database_url".to_string(),
                ));
            }
            if self.max_connections == 0 {
                return Err(CheckpointError::Config(
                    "max_connections must be greater than zero".to_string(),
                ));
            }
        }
        if !crate::store::is_identifier(&self.table_name) {
            return Err(CheckpointError::Config(format!(
                "invalid table name: {:?}",
                self.table_name
            )));
        }
        if self.backend == Backend::ClientSide && self.transforms.integrity_key_env.is_none() {
            tracing::warn!("Client-side checkpoints without an integrity key can be forged by callers");
        }
        Ok(())
    }

    /// The integrity key named by the settings, read from the environment
    pub fn integrity_key(&self) -> Result<Option<Vec<u8>>> {
        let Some(var) = &self.transforms.integrity_key_env else {
            return Ok(None);
        };
        let encoded = std::env::var(var).map_err(|_| {
            CheckpointError::Config(format!("Environment variable '{}' not found", var))
        })?;
        STANDARD
            .decode(encoded.trim())
            .map(Some)
            .map_err(|e| CheckpointError::Config(format!("Integrity key in '{}' is not base64: {}", var, e)))
    }

    /// The configured transform pipeline, or `None` when no transform is enabled
    pub fn build_pipeline(&self) -> Result<Option<Pipeline>> {
        let mut pipeline = Pipeline::new();
        if let Some(level) = self.transforms.compression {
            let max_output = self.max_checkpoint_bytes.saturating_add(ENVELOPE_ALLOWANCE);
            pipeline.push(self.maybe_pooled(Compression::new(level).with_max_output(max_output)));
        }
        if let Some(key) = self.integrity_key()? {
            pipeline.push(self.maybe_pooled(Integrity::new(key)?));
        }
        Ok((!pipeline.is_empty()).then_some(pipeline))
    }

    fn maybe_pooled<T: Transform + 'static>(&self, transform: T) -> Arc<dyn Transform> {
        if self.transforms.pooled {
            Arc::new(Pooled::new(transform))
        } else {
            Arc::new(transform)
        }
    }

    /// A codec bounded by `max_checkpoint_bytes` and verifying through a
    /// fingerprint cache of the configured capacity
    pub fn codec<E: Engine>(
        &self,
        engine: Arc<E>,
        registry: Arc<ReferenceRegistry>,
        index: Arc<FunctionIndex>,
    ) -> CheckpointCodec<E> {
        CheckpointCodec::new(
            engine,
            registry,
            index,
            FingerprintVerifier::new(self.fingerprint_cache()),
        )
        .with_size_limit(self.max_checkpoint_bytes)
    }

    pub fn id_generator(&self) -> Arc<dyn IdGenerator> {
        match self.key_policy {
            KeyPolicy::Random => Arc::new(RandomIdGenerator::new()),
            KeyPolicy::ContentDerived => Arc::new(ContentIdGenerator),
        }
    }

    pub fn fingerprint_cache(&self) -> Arc<FingerprintCache> {
        Arc::new(FingerprintCache::new(self.fingerprint_cache_capacity))
    }

    /// Script repository over `scripts.root`, if one is configured
    pub fn script_repository<C: ScriptCompiler>(&self, compiler: Arc<C>) -> Option<ScriptRepository<C>> {
        let root = self.scripts.root.as_ref()?;
        Some(
            ScriptRepository::new(root, compiler)
                .with_prefix(self.scripts.prefix.clone())
                .with_stale_check(Duration::from_millis(self.scripts.stale_check_ms)),
        )
    }

    /// Open the configured store
    pub async fn open_store(&self) -> Result<Arc<dyn CheckpointStore>> {
        let pipeline = self.build_pipeline()?;
        let store: Arc<dyn CheckpointStore> = match self.backend {
            Backend::Session => {
                let mut store = SessionStore::new(self.max_states)?
                    .with_id_generator(self.id_generator())
                    .with_collision_policy(self.on_collision);
                if let Some(pipeline) = pipeline {
                    store = store.with_pipeline(pipeline);
                }
                Arc::new(store)
            }
            Backend::Durable => {
                let url = self.database_url.as_deref().ok_or_else(|| {
                    CheckpointError::Config("durable backend requires database_url".to_string())
                })?;
                let mut store = DurableStore::connect(url, self.max_connections)
                    .await?
                    .with_table(self.table_name.clone())?;
                if let Some(pipeline) = pipeline {
                    store = store.with_pipeline(pipeline);
                }
                store.ensure_schema().await?;
                Arc::new(store)
            }
            Backend::ClientSide => {
                let mut store = TokenStore::new();
                if let Some(pipeline) = pipeline {
                    store = store.with_pipeline(pipeline);
                }
                Arc::new(store)
            }
        };
        tracing::debug!(backend = store.name(), "Opened checkpoint store");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CheckpointRecord, Scope};
    use std::fs;

    #[test]
    fn test_defaults() {
        let settings = StorageSettings::default();
        assert_eq!(settings.backend, Backend::Session);
        assert_eq!(settings.max_states, 100);
        assert_eq!(settings.table_name, "flowstates");
        assert_eq!(settings.scripts.stale_check_ms, 10_000);
        settings.validate().unwrap();
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowstate.yaml");
        fs::write(
            &path,
            "backend: durable\ndatabase_url: \"sqlite::memory:\"\nmax_states: 5\ntransforms:\n  compression: fast\n",
        )
        .unwrap();
        let settings = StorageSettings::from_file(&path).unwrap();
        assert_eq!(settings.backend, Backend::Durable);
        assert_eq!(settings.max_states, 5);
        assert_eq!(settings.transforms.compression, Some(CompressionLevel::Fast));
        assert!(settings.transforms.pooled);
        settings.validate().unwrap();
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowstate.json");
        fs::write(
            &path,
            r#"{"backend": "client_side", "key_policy": "content_derived", "on_collision": "reject"}"#,
        )
        .unwrap();
        let settings = StorageSettings::from_file(&path).unwrap();
        assert_eq!(settings.backend, Backend::ClientSide);
        assert_eq!(settings.key_policy, KeyPolicy::ContentDerived);
        assert_eq!(settings.on_collision, CollisionPolicy::Reject);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowstate.ini");
        fs::write(&path, "backend=session").unwrap();
        assert!(matches!(
            StorageSettings::from_file(&path),
            Err(CheckpointError::Config(_))
        ));
    }

    #[test]
    fn test_validation_errors() {
        let durable = StorageSettings {
            backend: Backend::Durable,
            ..Default::default()
        };
        assert!(durable.validate().is_err());

        let empty = StorageSettings {
            max_states: 0,
            ..Default::default()
        };
        assert!(empty.validate().is_err());

        let bad_table = StorageSettings {
            table_name: "states; --".to_string(),
            ..Default::default()
        };
        assert!(bad_table.validate().is_err());
    }

    #[test]
    fn test_env_overlay() {
        std::env::set_var("FLOWSTATE_MAX_STATES", "7");
        std::env::set_var("FLOWSTATE_BACKEND", "client_side");
        std::env::set_var("FLOWSTATE_COMPRESSION", "maximum");
        let mut settings = StorageSettings::default();
        let result = settings.apply_env();
        std::env::remove_var("FLOWSTATE_MAX_STATES");
        std::env::remove_var("FLOWSTATE_BACKEND");
        std::env::remove_var("FLOWSTATE_COMPRESSION");

        result.unwrap();
        assert_eq!(settings.max_states, 7);
        assert_eq!(settings.backend, Backend::ClientSide);
        assert_eq!(settings.transforms.compression, Some(CompressionLevel::Maximum));
    }

    #[test]
    fn test_pipeline_from_settings() {
        std::env::set_var("FLOWSTATE_TEST_PIPELINE_KEY", STANDARD.encode(b"signing key"));
        let settings = StorageSettings {
            transforms: TransformSettings {
                compression: Some(CompressionLevel::Default),
                integrity_key_env: Some("FLOWSTATE_TEST_PIPELINE_KEY".to_string()),
                pooled: true,
            },
            ..Default::default()
        };
        let pipeline = settings.build_pipeline().unwrap().unwrap();
        assert_eq!(pipeline.names(), vec!["compression", "integrity"]);
        let encoded = pipeline.encode(b"state".to_vec()).unwrap();
        assert_eq!(pipeline.decode(encoded).unwrap(), b"state");

        assert!(StorageSettings::default().build_pipeline().unwrap().is_none());
    }

    #[test]
    fn test_missing_integrity_key_env() {
        let settings = StorageSettings {
            transforms: TransformSettings {
                integrity_key_env: Some("FLOWSTATE_TEST_UNSET_KEY".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            settings.build_pipeline(),
            Err(CheckpointError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_open_each_backend() {
        let scope = Scope::new("s");
        for backend in [Backend::Session, Backend::Durable, Backend::ClientSide] {
            let settings = StorageSettings {
                backend,
                database_url: Some("sqlite::memory:".to_string()),
                max_connections: 1,
                transforms: TransformSettings {
                    compression: Some(CompressionLevel::Fast),
                    ..Default::default()
                },
                ..Default::default()
            };
            let store = settings.open_store().await.unwrap();
            let key = store
                .put(&scope, CheckpointRecord::new(b"state".to_vec()))
                .await
                .unwrap();
            let record = store.get(&scope, &key).await.unwrap().unwrap();
            assert_eq!(record.bytes, b"state", "backend {:?}", backend);
        }
    }

    #[test]
    fn test_script_repository_requires_root() {
        let engine = Arc::new(crate::testing::ScriptedEngine::new());
        assert!(StorageSettings::default()
            .script_repository(engine.clone())
            .is_none());
        let settings = StorageSettings {
            scripts: ScriptSettings {
                root: Some(PathBuf::from("/srv/flows")),
                ..Default::default()
            },
            ..Default::default()
        };
        let repo = settings.script_repository(engine).unwrap();
        assert_eq!(repo.root(), Path::new("/srv/flows"));
    }

    #[test]
    fn test_codec_uses_size_limit() {
        let engine = Arc::new(crate::testing::ScriptedEngine::new());
        engine.set_source("flow.s", "ask name?\n");
        let index = Arc::new(FunctionIndex::with_source(engine.clone()));
        index.script("flow.s").unwrap();
        let registry = Arc::new(ReferenceRegistry::new(engine.clone()));
        let settings = StorageSettings {
            max_checkpoint_bytes: 64 * 1024,
            fingerprint_cache_capacity: 8,
            ..Default::default()
        };
        let codec = settings.codec(engine.clone(), registry.clone(), index.clone());
        assert_eq!(codec.size_limit(), 64 * 1024);
        assert_eq!(codec.verifier().cache().capacity(), 8);

        let computation = engine.start("flow.s").unwrap().into_suspended().unwrap();
        let bytes = codec.serialize(&computation, None, None).unwrap();
        assert!(codec.deserialize(&bytes, None, None).is_ok());

        let strict = StorageSettings {
            max_checkpoint_bytes: bytes.len() as u64 - 1,
            ..Default::default()
        }
        .codec(engine, registry, index);
        assert!(matches!(
            strict.deserialize(&bytes, None, None),
            Err(CheckpointError::CorruptCheckpoint(_))
        ));
    }

    #[test]
    fn test_compression_output_capped_by_settings() {
        let settings = StorageSettings {
            max_checkpoint_bytes: 1024,
            transforms: TransformSettings {
                compression: Some(CompressionLevel::Default),
                ..Default::default()
            },
            ..Default::default()
        };
        let pipeline = settings.build_pipeline().unwrap().unwrap();
        let fits = vec![0u8; 1024 + ENVELOPE_ALLOWANCE as usize];
        let encoded = pipeline.encode(fits.clone()).unwrap();
        assert_eq!(pipeline.decode(encoded).unwrap(), fits);

        let bomb = pipeline.encode(vec![0u8; 1024 * 1024]).unwrap();
        assert!(matches!(
            pipeline.decode(bomb),
            Err(CheckpointError::CorruptCheckpoint(_))
        ));
    }
}
