//! File-backed script repository
//!
//! Scripts live under a root directory. Each path is compiled on first use
//! and recompiled when the file's modification time changes. To keep hot
//! paths off the filesystem, a file is only re-checked once its stale-check
//! period has elapsed since the last check.
//!
//! Requested paths come from checkpoint data. A path that would leave the
//! root (`..`, an absolute path, a drive prefix) is reported as missing, and
//! only paths naming an existing file keep a cache entry.

use crate::cache::Cached;
use crate::error::{CheckpointError, Result};
use crate::index::{CompiledScript, ScriptSource};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Default period during which a loaded script is not re-checked
pub const DEFAULT_STALE_CHECK: Duration = Duration::from_secs(10);

/// Compiles script source text
pub trait ScriptCompiler: Send + Sync {
    fn compile(&self, path: &str, source: &str) -> Result<CompiledScript>;
}

/// Loads and caches compiled scripts from a directory
pub struct ScriptRepository<C: ScriptCompiler> {
    root: PathBuf,
    prefix: String,
    stale_check: Duration,
    compiler: Arc<C>,
    entries: DashMap<String, Arc<Mutex<Cached<Arc<CompiledScript>>>>>,
}

impl<C: ScriptCompiler> ScriptRepository<C> {
    pub fn new(root: impl Into<PathBuf>, compiler: Arc<C>) -> Self {
        Self {
            root: root.into(),
            prefix: String::new(),
            stale_check: DEFAULT_STALE_CHECK,
            compiler,
            entries: DashMap::new(),
        }
    }

    /// Prefix prepended to every requested path before joining it to the root
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_stale_check(mut self, period: Duration) -> Self {
        self.stale_check = period;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File under the root for `path`, or `None` if it would escape the root
    fn file_for(&self, path: &str) -> Option<PathBuf> {
        let relative = PathBuf::from(format!("{}{}", self.prefix, path));
        let inside = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        inside.then(|| self.root.join(relative))
    }

    /// Current compiled version of `path`, or `None` if the file does not exist
    pub fn get(&self, path: &str) -> Result<Option<Arc<CompiledScript>>> {
        let Some(file) = self.file_for(path) else {
            tracing::warn!(script = %path, "Script path outside the repository root");
            return Ok(None);
        };
        let entry = match self.entries.get(path) {
            Some(entry) => entry.clone(),
            None if modified(&file)?.is_none() => return Ok(None),
            None => self.entries.entry(path.to_string()).or_default().clone(),
        };

        let mut cached = entry.lock();
        let before = cached.epoch();
        let script = cached.get_or_refresh(
            self.stale_check,
            || modified(&file),
            || {
                let source = std::fs::read_to_string(&file)?;
                self.compiler.compile(path, &source).map(Arc::new)
            },
        )?;
        if cached.epoch() != before {
            tracing::debug!(
                script = %path,
                generation = cached.epoch(),
                present = script.is_some(),
                "Script (re)loaded"
            );
        }
        drop(cached);
        if script.is_none() {
            self.entries
                .remove_if(path, |_, current| Arc::ptr_eq(current, &entry));
        }
        Ok(script)
    }

    /// Number of paths with a cached script
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C: ScriptCompiler> ScriptSource for ScriptRepository<C> {
    fn load(&self, path: &str) -> Result<Option<Arc<CompiledScript>>> {
        self.get(path)
    }
}

fn modified(file: &Path) -> Result<Option<SystemTime>> {
    match std::fs::metadata(file) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CheckpointError::Script {
            path: file.display().to_string(),
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FunctionNode;
    use crate::value::Handle;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Compiles every script to a single function whose handle counts compilations
    #[derive(Default)]
    struct CountingCompiler {
        compiled: AtomicU64,
    }

    impl ScriptCompiler for CountingCompiler {
        fn compile(&self, path: &str, source: &str) -> Result<CompiledScript> {
            if source.contains("syntax error") {
                return Err(CheckpointError::Script {
                    path: path.to_string(),
                    message: "syntax error".to_string(),
                });
            }
            let n = self.compiled.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CompiledScript::new(path, FunctionNode::new(Handle(n))))
        }
    }

    fn set_mtime(file: &Path, secs: u64) {
        let f = std::fs::File::options().write(true).open(file).unwrap();
        f.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ScriptRepository::new(dir.path(), Arc::new(CountingCompiler::default()));
        for n in 0..100 {
            assert!(repo.get(&format!("nope{}.s", n)).unwrap().is_none());
        }
        assert!(repo.is_empty());
    }

    #[test]
    fn test_deleted_file_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("flow.s");
        std::fs::write(&file, "v1").unwrap();
        let repo = ScriptRepository::new(dir.path(), Arc::new(CountingCompiler::default()))
            .with_stale_check(Duration::ZERO);
        assert!(repo.get("flow.s").unwrap().is_some());
        assert_eq!(repo.len(), 1);

        std::fs::remove_file(&file).unwrap();
        assert!(repo.get("flow.s").unwrap().is_none());
        assert!(repo.is_empty());
    }

    #[test]
    fn test_paths_outside_root_are_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("flows");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(dir.path().join("secret.s"), "x").unwrap();
        std::fs::write(root.join("inside.s"), "x").unwrap();
        let compiler = Arc::new(CountingCompiler::default());
        let repo = ScriptRepository::new(&root, compiler.clone());

        let absolute = dir.path().join("secret.s");
        for path in ["../secret.s", "sub/../../secret.s", absolute.to_str().unwrap()] {
            assert!(repo.get(path).unwrap().is_none(), "{} escaped the root", path);
        }
        assert_eq!(compiler.compiled.load(Ordering::SeqCst), 0);
        assert!(repo.is_empty());

        assert!(repo.get("./inside.s").unwrap().is_some());
    }

    #[test]
    fn test_loads_once_within_stale_period() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("flow.s"), "fn a {\n}\n").unwrap();
        let compiler = Arc::new(CountingCompiler::default());
        let repo = ScriptRepository::new(dir.path(), compiler.clone());

        let first = repo.get("flow.s").unwrap().unwrap();
        let second = repo.get("flow.s").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiler.compiled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reloads_modified_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("flow.s");
        std::fs::write(&file, "v1").unwrap();
        set_mtime(&file, 1_000);

        let compiler = Arc::new(CountingCompiler::default());
        let repo = ScriptRepository::new(dir.path(), compiler.clone())
            .with_stale_check(Duration::ZERO);

        let first = repo.get("flow.s").unwrap().unwrap();
        assert_eq!(first.root.handle, Handle(1));

        // Unchanged stamp keeps the compiled script.
        let again = repo.get("flow.s").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        std::fs::write(&file, "v2").unwrap();
        set_mtime(&file, 2_000);
        let second = repo.get("flow.s").unwrap().unwrap();
        assert_eq!(second.root.handle, Handle(2));
    }

    #[test]
    fn test_prefix_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("flows")).unwrap();
        std::fs::write(dir.path().join("flows/cart.s"), "x").unwrap();
        let repo = ScriptRepository::new(dir.path(), Arc::new(CountingCompiler::default()))
            .with_prefix("flows/");
        let script = repo.load("cart.s").unwrap().unwrap();
        assert_eq!(script.path, "cart.s");
    }

    #[test]
    fn test_compile_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.s"), "syntax error").unwrap();
        let repo = ScriptRepository::new(dir.path(), Arc::new(CountingCompiler::default()));
        let err = repo.get("bad.s").unwrap_err();
        assert!(matches!(err, CheckpointError::Script { .. }));
    }
}
