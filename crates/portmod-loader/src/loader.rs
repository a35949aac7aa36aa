//! The per-run package loader.
//!
//! [`LoaderContext`] resolves a definition path to a [`Package`] through, in
//! order: the success/failure memo, the on-disk cache, and finally a
//! sandboxed worker. Memo maps live as long as the context, so a path is
//! evaluated in a worker at most once per run, whether it loads or fails.

use crate::cache::{self, CacheEntry};
use crate::error::LoadError;
use crate::package::Package;
use crate::repo::RepoTree;
use portmod_core::atom::Atom;
use portmod_core::config::LoaderSettings;
use portmod_core::permissions::PermissionSet;
use portmod_core::protocol::{LoadOutput, WorkerAction, WorkerKind};
use portmod_core::PORTMOD_VERSION;
use portmod_sandbox::{ExecRequest, Executor, FailureReason, SandboxedError};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

type Key = (PathBuf, bool);

#[derive(Default)]
struct Memo {
    loaded: HashMap<Key, Package>,
    failed: HashMap<Key, LoadError>,
}

pub struct LoaderContext {
    repos: RepoTree,
    executor: Arc<dyn Executor>,
    cache_dir: PathBuf,
    tool_version: String,
    settings: LoaderSettings,
    memo: Mutex<Memo>,
    /// One lock per key, held across the whole load so concurrent callers
    /// for the same path wait for the first instead of spawning their own.
    key_locks: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LoaderContext {
    pub fn new(repos: RepoTree, executor: Arc<dyn Executor>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos,
            executor,
            cache_dir: cache_dir.into(),
            tool_version: PORTMOD_VERSION.to_string(),
            settings: LoaderSettings::default(),
            memo: Mutex::new(Memo::default()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_settings(mut self, settings: LoaderSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Version stamped into (and required of) cache entries.
    pub fn with_tool_version(mut self, version: impl Into<String>) -> Self {
        self.tool_version = version.into();
        self
    }

    pub fn repos(&self) -> &RepoTree {
        &self.repos
    }

    pub fn tool_version(&self) -> &str {
        &self.tool_version
    }

    /// Cache file backing the definition at `path`.
    pub fn cache_file(&self, path: &Path, installed: bool) -> Result<PathBuf, LoadError> {
        let atom = self.repos.atom_for_path(path, installed)?;
        Ok(cache::cache_path(&self.cache_dir, &atom))
    }

    /// Load the definition at `path`.
    ///
    /// Returns `Ok(None)` only when a failure was already recorded for this
    /// path and load errors are tolerated.
    pub fn load(&self, path: &Path, installed: bool) -> Result<Option<Package>, LoadError> {
        let key: Key = (path.to_path_buf(), installed);
        let key_lock = {
            let mut locks = lock(&self.key_locks);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let _guard = lock(&key_lock);

        {
            let memo = lock(&self.memo);
            if let Some(err) = memo.failed.get(&key) {
                if self.settings.tolerate_errors {
                    return Ok(None);
                }
                return Err(LoadError::PreviouslyEncountered(Box::new(err.clone())));
            }
            if let Some(pkg) = memo.loaded.get(&key) {
                return Ok(Some(pkg.clone()));
            }
        }

        match self.load_uncached(path, installed) {
            Ok(pkg) => {
                lock(&self.memo).loaded.insert(key, pkg.clone());
                Ok(Some(pkg))
            }
            Err(err) => {
                lock(&self.memo).failed.insert(key, err.clone());
                Err(err)
            }
        }
    }

    /// [`load`](Self::load), but with tolerance enabled any failure becomes
    /// `Ok(None)` and a warning.
    pub fn safe_load(&self, path: &Path, installed: bool) -> Result<Option<Package>, LoadError> {
        match self.load(path, installed) {
            Ok(pkg) => Ok(pkg),
            Err(err) if self.settings.tolerate_errors => {
                tracing::warn!("Skipping {}: {}", path.display(), err);
                Ok(None)
            }
            Err(err) => {
                tracing::error!("Failed to load {}: {}", path.display(), err);
                Err(err)
            }
        }
    }

    /// Every package `atom` selects, installed copies included. A bare atom
    /// matching more than one package is an error, never a guess.
    pub fn load_atom(&self, atom: &Atom) -> Result<Vec<Package>, LoadError> {
        let mut packages = Vec::new();
        for located in self.repos.find_unique(atom)? {
            if let Some(pkg) = self.safe_load(&located.path, located.installed)? {
                packages.push(pkg);
            }
        }
        Ok(packages)
    }

    fn load_uncached(&self, path: &Path, installed: bool) -> Result<Package, LoadError> {
        let atom = self.repos.atom_for_path(path, installed)?;
        let cache_file = cache::cache_path(&self.cache_dir, &atom);

        if cache::cache_valid(&cache_file, &self.tool_version) {
            tracing::debug!("Cache hit for {}", atom);
            let entry = cache::read_cache(&cache_file)?;
            return Ok(Package::from_entry(atom, path, installed, entry));
        }

        if self.settings.in_sandbox {
            return Err(LoadError::LoadFromSandbox {
                path: path.to_path_buf(),
            });
        }

        tracing::info!("Loading {}", atom);
        let request = ExecRequest::new(
            WorkerKind::Pybuild,
            path,
            WorkerAction::Load,
            self.load_permissions(path, installed),
        );
        let value = self.executor.execute(&request)?.ok_or_else(|| {
            SandboxedError::new(WorkerAction::Load, path, FailureReason::NoOutput)
        })?;
        let output: LoadOutput = serde_json::from_value(value).map_err(|e| LoadError::InvalidOutput {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let common_dir = self
            .repos
            .repository_for(path, installed)
            .map(|repo| repo.common_dir());
        let text = cache::create_cache_str(
            path,
            &output,
            common_dir.as_deref(),
            Some(&self.tool_version),
        )?;
        cache::write_cache(&cache_file, &text)?;
        let entry: CacheEntry = cache::read_cache(&cache_file)?;
        Ok(Package::from_entry(atom, path, installed, entry))
    }

    /// Grants for evaluating a definition: its own repository, read-only.
    /// The executor adds its fixed grants on top.
    pub fn load_permissions(&self, path: &Path, installed: bool) -> PermissionSet {
        let roots = self
            .repos
            .repository_for(path, installed)
            .map(|repo| repo.root.clone());
        PermissionSet::new().with_read_only(roots)
    }

    /// Run a non-load action (`can-update-live`, `dump-environment`) against
    /// a loaded package. The package's fields seed the worker's state, and
    /// its scratch directory persists until [`clear_path`](Self::clear_path).
    pub fn run_action(&self, pkg: &Package, action: WorkerAction) -> Result<Option<Value>, LoadError> {
        let request = ExecRequest::new(
            WorkerKind::Pybuild,
            pkg.file(),
            action,
            self.load_permissions(pkg.file(), pkg.installed()),
        )
        .with_init(Value::Object(pkg.fields().clone()))
        .with_saved_state(pkg.atom().to_string());
        Ok(self.executor.execute(&request)?)
    }

    /// Forget everything loaded this run.
    pub fn clear(&self) {
        {
            let mut memo = lock(&self.memo);
            memo.loaded.clear();
            memo.failed.clear();
        }
        lock(&self.key_locks).clear();
    }

    /// Forget `path` (both its available and installed copies) after its
    /// file changed, and drop any scratch state saved for it.
    pub fn clear_path(&self, path: &Path) {
        {
            let mut memo = lock(&self.memo);
            for installed in [false, true] {
                let key: Key = (path.to_path_buf(), installed);
                memo.loaded.remove(&key);
                memo.failed.remove(&key);
            }
        }
        {
            let mut locks = lock(&self.key_locks);
            for installed in [false, true] {
                locks.remove(&(path.to_path_buf(), installed));
            }
        }
        for installed in [false, true] {
            if let Ok(atom) = self.repos.atom_for_path(path, installed) {
                self.executor.clear_state(&atom.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::repo::Repository;
    use crate::test_support::{write_definition, FakeExecutor};
    use serde_json::json;
    use std::fs;
    use std::time::Duration;

    struct Fixture {
        tmp: tempfile::TempDir,
        repo: PathBuf,
        cache_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let repo = tmp.path().join("repo");
            let cache_dir = tmp.path().join("cache");
            fs::create_dir_all(&repo).unwrap();
            Self { tmp, repo, cache_dir }
        }

        fn tree(&self) -> RepoTree {
            RepoTree::new(vec![Repository::new("main", &self.repo)], None)
        }

        fn context(&self, executor: Arc<FakeExecutor>, version: &str) -> LoaderContext {
            LoaderContext::new(self.tree(), executor, &self.cache_dir).with_tool_version(version)
        }
    }

    fn load_output(name: &str) -> Value {
        json!({"fields": {"NAME": name, "DESC": "A test package", "_private": true}, "sources": []})
    }

    fn cached_version(path: &Path) -> Option<String> {
        cache::read_cache(path).unwrap().portmod_version
    }

    #[test]
    fn test_absent_cache_spawns_once_and_writes_entry() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let exec = Arc::new(FakeExecutor::returning(load_output("x")));
        let ctx = f.context(exec.clone(), "2.0");

        let pkg = ctx.load(&path, false).unwrap().unwrap();
        assert_eq!(exec.calls(), 1);
        assert_eq!(pkg.file(), path.as_path());
        assert_eq!(pkg.name(), "x");
        assert!(pkg.get("_private").is_none());

        let cache_file = ctx.cache_file(&path, false).unwrap();
        assert!(cache_file.ends_with("pybuild/main/foo/x-1.0.json"));
        assert_eq!(cached_version(&cache_file).as_deref(), Some("2.0"));

        let requests = exec.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.action, WorkerAction::Load);
        assert_eq!(request.kind, WorkerKind::Pybuild);
        assert!(request.permissions.read_only().contains(&f.repo));
        assert!(!request.permissions.network());
    }

    #[test]
    fn test_valid_cache_needs_no_worker() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let first = Arc::new(FakeExecutor::returning(load_output("x")));
        let loaded = f.context(first, "2.0").load(&path, false).unwrap().unwrap();

        let second = Arc::new(FakeExecutor::failing());
        let ctx = f.context(second.clone(), "2.0");
        let pkg = ctx.load(&path, false).unwrap().unwrap();
        assert_eq!(second.calls(), 0);
        assert_eq!(pkg, loaded);
    }

    #[test]
    fn test_version_bump_reloads_and_rewrites() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        f.context(Arc::new(FakeExecutor::returning(load_output("x"))), "2.0")
            .load(&path, false)
            .unwrap();

        let exec = Arc::new(FakeExecutor::returning(load_output("x")));
        let ctx = f.context(exec.clone(), "2.1");
        ctx.load(&path, false).unwrap();
        assert_eq!(exec.calls(), 1);
        let cache_file = ctx.cache_file(&path, false).unwrap();
        assert_eq!(cached_version(&cache_file).as_deref(), Some("2.1"));
    }

    #[test]
    fn test_failure_is_memoized() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let exec = Arc::new(FakeExecutor::failing());
        let ctx = f.context(exec.clone(), "2.0");

        let first = ctx.load(&path, false).unwrap_err();
        assert!(matches!(first, LoadError::Sandboxed(_)));
        let second = ctx.load(&path, false).unwrap_err();
        match &second {
            LoadError::PreviouslyEncountered(inner) => {
                assert!(matches!(**inner, LoadError::Sandboxed(_)))
            }
            other => panic!("expected PreviouslyEncountered, got {:?}", other),
        }
        assert!(matches!(second.root_cause(), LoadError::Sandboxed(_)));
        assert_eq!(exec.calls(), 1);
        assert!(!ctx.cache_file(&path, false).unwrap().exists());
    }

    #[test]
    fn test_success_is_memoized() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let exec = Arc::new(FakeExecutor::returning(load_output("x")));
        let ctx = f.context(exec.clone(), "2.0");
        ctx.load(&path, false).unwrap();
        // Removing the cache file does not matter once memoized.
        fs::remove_dir_all(&f.cache_dir).unwrap();
        ctx.load(&path, false).unwrap();
        assert_eq!(exec.calls(), 1);

        assert_eq!(lock(&ctx.key_locks).len(), 1);
        ctx.clear();
        assert!(lock(&ctx.key_locks).is_empty());
        ctx.load(&path, false).unwrap();
        assert_eq!(exec.calls(), 2);
    }

    #[test]
    fn test_tolerance() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let exec = Arc::new(FakeExecutor::failing());
        let ctx = f.context(exec.clone(), "2.0").with_settings(LoaderSettings {
            tolerate_errors: true,
            in_sandbox: false,
        });

        // First failure still propagates from load; safe_load swallows it.
        assert!(ctx.load(&path, false).is_err());
        assert!(ctx.load(&path, false).unwrap().is_none());
        assert!(ctx.safe_load(&path, false).unwrap().is_none());
        assert_eq!(exec.calls(), 1);

        let other = write_definition(&f.repo, "foo", "y", "1.0", "NAME: y\n");
        assert!(ctx.safe_load(&other, false).unwrap().is_none());
    }

    #[test]
    fn test_safe_load_propagates_by_default() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let ctx = f.context(Arc::new(FakeExecutor::failing()), "2.0");
        assert!(ctx.safe_load(&path, false).is_err());
    }

    #[test]
    fn test_inside_sandbox_only_cache_hits_load() {
        let f = Fixture::new();
        let cached = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let uncached = write_definition(&f.repo, "foo", "y", "1.0", "NAME: y\n");
        f.context(Arc::new(FakeExecutor::returning(load_output("x"))), "2.0")
            .load(&cached, false)
            .unwrap();

        let exec = Arc::new(FakeExecutor::returning(load_output("y")));
        let ctx = f.context(exec.clone(), "2.0").with_settings(LoaderSettings {
            tolerate_errors: false,
            in_sandbox: true,
        });
        assert!(ctx.load(&cached, false).unwrap().is_some());
        assert!(matches!(
            ctx.load(&uncached, false),
            Err(LoadError::LoadFromSandbox { .. })
        ));
        assert_eq!(exec.calls(), 0);
    }

    #[test]
    fn test_ambiguous_bare_atom() {
        let f = Fixture::new();
        let other = f.tmp.path().join("other");
        write_definition(&f.repo, "foo", "bar", "1.0", "");
        write_definition(&other, "foo", "bar", "1.0", "");
        let tree = RepoTree::new(
            vec![Repository::new("main", &f.repo), Repository::new("other", &other)],
            None,
        );
        let exec = Arc::new(FakeExecutor::returning(load_output("bar")));
        let ctx = LoaderContext::new(tree, exec.clone(), &f.cache_dir);

        match ctx.load_atom(&Atom::parse("foo/bar").unwrap()) {
            Err(LoadError::AmbiguousAtom { candidates, .. }) => {
                let names: Vec<String> = candidates.iter().map(|c| c.to_string()).collect();
                assert_eq!(names, vec!["foo/bar-1.0::main", "foo/bar-1.0::other"]);
            }
            other => panic!("expected AmbiguousAtom, got {:?}", other),
        }
        assert_eq!(exec.calls(), 0);

        let pkgs = ctx.load_atom(&Atom::parse("foo/bar::other").unwrap()).unwrap();
        assert_eq!(pkgs.len(), 1);
        assert_eq!(pkgs[0].atom().repo(), "other");
    }

    #[test]
    fn test_installed_copy_is_separate() {
        let f = Fixture::new();
        let db = f.tmp.path().join("db");
        let available = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let installed = write_definition(&db, "foo", "x", "1.0", "NAME: x\n");
        let tree = RepoTree::new(
            vec![Repository::new("main", &f.repo)],
            Some(Repository::new("installed", &db)),
        );
        let exec = Arc::new(FakeExecutor::returning(load_output("x")));
        let ctx = LoaderContext::new(tree, exec.clone(), &f.cache_dir);

        let pkgs = ctx.load_atom(&Atom::parse("foo/x").unwrap()).unwrap();
        assert_eq!(pkgs.len(), 2);
        assert_eq!(exec.calls(), 2);
        let pkg = ctx.load(&installed, true).unwrap().unwrap();
        assert!(pkg.installed());
        assert!(pkg.atom().is_installed());
        assert!(ctx.cache_file(&installed, true).unwrap().ends_with("pybuild/installed/foo/x-1.0.json"));
        assert!(ctx.load(&available, false).unwrap().is_some());
        assert_eq!(exec.calls(), 2);
    }

    #[test]
    fn test_ancestor_change_invalidates() {
        let f = Fixture::new();
        let common = f.repo.join("common");
        fs::create_dir_all(&common).unwrap();
        let base = common.join("base.yaml");
        fs::write(&base, "KEYWORDS: openmw\n").unwrap();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "inherit: [base]\n");
        let output = json!({"fields": {"KEYWORDS": "openmw"}, "sources": [base]});

        f.context(Arc::new(FakeExecutor::returning(output.clone())), "2.0")
            .load(&path, false)
            .unwrap();
        let unchanged = Arc::new(FakeExecutor::returning(output.clone()));
        f.context(unchanged.clone(), "2.0").load(&path, false).unwrap();
        assert_eq!(unchanged.calls(), 0);

        fs::write(&base, "KEYWORDS: tes3mp\n").unwrap();
        let changed = Arc::new(FakeExecutor::returning(output));
        f.context(changed.clone(), "2.0").load(&path, false).unwrap();
        assert_eq!(changed.calls(), 1);
    }

    #[test]
    fn test_cache_write_failure_propagates_and_is_memoized() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        fs::write(&f.cache_dir, "not a directory").unwrap();
        let exec = Arc::new(FakeExecutor::returning(load_output("x")));
        let ctx = f.context(exec.clone(), "2.0");

        assert!(matches!(
            ctx.load(&path, false),
            Err(LoadError::Cache(CacheError::Io { .. }))
        ));
        assert!(ctx.load(&path, false).is_err());
        assert_eq!(exec.calls(), 1);
    }

    #[test]
    fn test_malformed_and_missing_output() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "");
        let ctx = f.context(Arc::new(FakeExecutor::returning(json!("nope"))), "2.0");
        assert!(matches!(
            ctx.load(&path, false),
            Err(LoadError::InvalidOutput { .. })
        ));

        let ctx = f.context(Arc::new(FakeExecutor::new(|_| Ok(None))), "2.0");
        match ctx.load(&path, false) {
            Err(LoadError::Sandboxed(e)) => assert_eq!(e.reason, FailureReason::NoOutput),
            other => panic!("expected NoOutput, got {:?}", other),
        }
    }

    #[test]
    fn test_path_outside_repositories() {
        let f = Fixture::new();
        let stray = write_definition(f.tmp.path(), "foo", "x", "1.0", "");
        let exec = Arc::new(FakeExecutor::returning(load_output("x")));
        let ctx = f.context(exec.clone(), "2.0");
        assert!(matches!(
            ctx.load(&stray, false),
            Err(LoadError::NotInRepository { .. })
        ));
        assert_eq!(exec.calls(), 0);
    }

    #[test]
    fn test_concurrent_loads_spawn_once() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let exec = Arc::new(FakeExecutor::new(|_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Some(load_output("x")))
        }));
        let ctx = f.context(exec.clone(), "2.0");

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| assert!(ctx.load(&path, false).unwrap().is_some()));
            }
        });
        assert_eq!(exec.calls(), 1);
    }

    #[test]
    fn test_clear_path_forgets_and_drops_state() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let exec = Arc::new(FakeExecutor::returning(load_output("x")));
        let ctx = f.context(exec.clone(), "2.0");
        ctx.load(&path, false).unwrap();

        let other = write_definition(&f.repo, "foo", "y", "1.0", "NAME: y\n");
        ctx.load(&other, false).unwrap();

        fs::write(&path, "NAME: changed\n").unwrap();
        ctx.clear_path(&path);
        {
            let locks = lock(&ctx.key_locks);
            assert!(!locks.contains_key(&(path.clone(), false)));
            assert!(locks.contains_key(&(other.clone(), false)));
        }
        ctx.load(&path, false).unwrap();
        assert_eq!(exec.calls(), 3);
        assert_eq!(exec.cleared.lock().unwrap().as_slice(), ["foo/x-1.0::main"]);
    }

    #[test]
    fn test_run_action_threads_fields_and_state() {
        let f = Fixture::new();
        let path = write_definition(&f.repo, "foo", "x", "1.0", "NAME: x\n");
        let exec = Arc::new(FakeExecutor::new(|req| match req.action {
            WorkerAction::Load => Ok(Some(load_output("x"))),
            WorkerAction::CanUpdateLive => Ok(Some(json!(false))),
            _ => Ok(None),
        }));
        let ctx = f.context(exec.clone(), "2.0");
        let pkg = ctx.load(&path, false).unwrap().unwrap();

        let live = ctx.run_action(&pkg, WorkerAction::CanUpdateLive).unwrap();
        assert_eq!(live, Some(json!(false)));
        assert!(ctx.run_action(&pkg, WorkerAction::DumpEnvironment).unwrap().is_none());

        let requests = exec.requests.lock().unwrap();
        let last = requests.last().unwrap();
        assert_eq!(last.state_key.as_deref(), Some("foo/x-1.0::main"));
        assert_eq!(last.init.as_ref().unwrap()["NAME"], json!("x"));
    }
}
