use crate::config::WatchConfig;
use crate::error::RuntimeResult;
use crate::loader::GenerationId;
use crate::orchestrator::ScriptLifecycleOrchestrator;
use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::any::Any;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Coalesces a burst of file events into a single reload request.
///
/// Linkers write an artifact in several steps, so the reload only fires once the file has been
/// quiet for the debounce window.
#[derive(Debug, Clone)]
pub struct ReloadDebouncer {
    window: Duration,
    last_event: Option<Instant>,
}

impl ReloadDebouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last_event: None }
    }

    pub fn record(&mut self, at: Instant) {
        self.last_event = Some(at);
    }

    pub fn is_pending(&self) -> bool {
        self.last_event.is_some()
    }

    /// True once, when the last recorded event is older than the window.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last_event {
            Some(at) if now.saturating_duration_since(at) >= self.window => {
                self.last_event = None;
                true
            }
            _ => false,
        }
    }
}

/// Watches one artifact file and reports when it was rebuilt.
pub struct ArtifactWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    artifact: PathBuf,
    watched_dir: PathBuf,
    debouncer: ReloadDebouncer,
}

impl ArtifactWatcher {
    pub fn new(artifact: impl AsRef<Path>, config: &WatchConfig) -> Result<Self> {
        let artifact = normalize_watch_path(artifact.as_ref());
        let watched_dir = artifact
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("artifact '{}' has no parent directory", artifact.display()))?;
        if !watched_dir.is_dir() {
            anyhow::bail!("path '{}' does not exist", watched_dir.display());
        }

        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(
                NotifyConfig::default().with_compare_contents(false).with_poll_interval(config.poll_interval()),
            )
            .context("configure artifact watcher")?;
        // The directory is watched because rebuilds usually replace the file instead of rewriting it.
        watcher
            .watch(&watched_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", watched_dir.display()))?;
        debug!(artifact = %artifact.display(), "watching script artifact");
        Ok(Self { watcher, rx, artifact, watched_dir, debouncer: ReloadDebouncer::new(config.debounce()) })
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Drains pending file events and returns true when a settled rebuild is waiting.
    pub fn poll_changed(&mut self) -> bool {
        let now = Instant::now();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                Ok(event) => {
                    if is_relevant(&event.kind) && event.paths.iter().any(|path| self.is_artifact(path)) {
                        self.debouncer.record(now);
                    }
                }
                Err(err) => warn!("script artifact watcher error: {err}"),
            }
        }
        self.debouncer.ready(now)
    }

    /// Reloads the orchestrator when the artifact changed, bringing the previously active tags back.
    pub fn reload_if_changed(
        &mut self,
        orchestrator: &mut ScriptLifecycleOrchestrator,
        engine: &mut dyn Any,
    ) -> Option<RuntimeResult<GenerationId>> {
        if !self.poll_changed() {
            return None;
        }
        if !self.artifact.is_file() {
            warn!(artifact = %self.artifact.display(), "script artifact disappeared; reload skipped");
            return None;
        }
        info!(artifact = %self.artifact.display(), "script artifact changed, reloading");
        Some(orchestrator.reload_artifact_restoring(engine, &self.artifact))
    }

    fn is_artifact(&self, path: &Path) -> bool {
        let normalized = normalize_watch_path(path);
        normalized == self.artifact
            || (normalized.parent() == Some(self.watched_dir.as_path())
                && normalized.file_name() == self.artifact.file_name())
    }

    /// Stops watching. Dropping the watcher does the same.
    pub fn stop(mut self) {
        if let Err(err) = self.watcher.unwatch(&self.watched_dir) {
            debug!("unwatching script artifact failed: {err}");
        }
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
    )
}

fn normalize_watch_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if let Ok(cwd) = env::current_dir() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    };
    if let Ok(canonical) = fs::canonicalize(&absolute) {
        return canonical;
    }
    match (absolute.parent().and_then(|parent| fs::canonicalize(parent).ok()), absolute.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        (Some(parent), None) => parent,
        (None, _) => absolute,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ArgsHandle, ObjectHandle, TypeExport, TypeTable};
    use crate::script::{Script, ScriptContext, ScriptRegistry};
    use std::thread;
    use tempfile::tempdir;

    fn fast_config() -> WatchConfig {
        WatchConfig { enabled: true, poll_interval_ms: 50, debounce_ms: 100 }
    }

    fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(value) = poll() {
                return Some(value);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }

    fn quiet_for<T>(window: Duration, mut poll: impl FnMut() -> Option<T>) -> usize {
        let deadline = Instant::now() + window;
        let mut fired = 0;
        while Instant::now() < deadline {
            fired += usize::from(poll().is_some());
            thread::sleep(Duration::from_millis(20));
        }
        fired
    }

    struct Idle;

    impl Script for Idle {
        fn load(&mut self, _ctx: &mut ScriptContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        fn update(&mut self, _ctx: &mut ScriptContext<'_>, _dt: f64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct IdleRegistry;

    impl ScriptRegistry for IdleRegistry {
        fn instantiate_scripts(&mut self, _tag: &str) -> anyhow::Result<Vec<Box<dyn Script>>> {
            Ok(vec![Box::new(Idle) as Box<dyn Script>])
        }

        fn reload(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    unsafe extern "C" fn make_registry(_args: ArgsHandle) -> ObjectHandle {
        ObjectHandle::registry(IdleRegistry)
    }

    static TYPES: [TypeExport; 1] = [TypeExport::new(c"kestrel.scripts.ScriptRegistry", make_registry)];

    #[test]
    fn debouncer_waits_for_quiet_window() {
        let start = Instant::now();
        let mut debouncer = ReloadDebouncer::new(Duration::from_millis(250));
        assert!(!debouncer.ready(start), "nothing recorded yet");

        debouncer.record(start);
        debouncer.record(start + Duration::from_millis(100));
        assert!(!debouncer.ready(start + Duration::from_millis(300)), "second event restarts the window");
        assert!(debouncer.ready(start + Duration::from_millis(350)));
        assert!(!debouncer.is_pending());
        assert!(!debouncer.ready(start + Duration::from_millis(900)), "fires once per burst");
    }

    #[test]
    fn relevant_events_exclude_access_and_remove() {
        assert!(is_relevant(&EventKind::Create(notify::event::CreateKind::File)));
        assert!(is_relevant(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_relevant(&EventKind::Remove(notify::event::RemoveKind::File)));
        assert!(!is_relevant(&EventKind::Access(notify::event::AccessKind::Any)));
    }

    #[test]
    fn watcher_matches_only_its_artifact() {
        let dir = tempdir().expect("temp dir");
        let artifact = dir.path().join("libgame_scripts.so");
        fs::write(&artifact, b"v1").expect("write artifact");
        let watcher = ArtifactWatcher::new(&artifact, &WatchConfig::default()).expect("watcher starts");
        assert!(watcher.is_artifact(&artifact));
        assert!(!watcher.is_artifact(&dir.path().join("libother.so")));
        watcher.stop();
    }

    #[test]
    fn missing_directory_is_rejected() {
        let dir = tempdir().expect("temp dir");
        let artifact = dir.path().join("absent").join("libgame_scripts.so");
        assert!(ArtifactWatcher::new(&artifact, &WatchConfig::default()).is_err());
    }

    #[test]
    fn rewriting_the_artifact_fires_once() {
        let dir = tempdir().expect("temp dir");
        let artifact = dir.path().join("libgame_scripts.so");
        fs::write(&artifact, b"v1").expect("write artifact");
        let mut watcher = ArtifactWatcher::new(&artifact, &fast_config()).expect("watcher starts");
        assert!(!watcher.poll_changed(), "nothing changed yet");

        fs::write(&artifact, b"v2 with a longer body").expect("rewrite artifact");
        let fired = wait_for(|| watcher.poll_changed().then_some(()));
        assert!(fired.is_some(), "rewrite was never reported");
        let again = quiet_for(Duration::from_millis(400), || watcher.poll_changed().then_some(()));
        assert_eq!(again, 0, "one rewrite reports one change");

        fs::write(dir.path().join("libother.so"), b"unrelated").expect("write sibling");
        let sibling = quiet_for(Duration::from_millis(400), || watcher.poll_changed().then_some(()));
        assert_eq!(sibling, 0, "sibling files are ignored");
        watcher.stop();
    }

    #[test]
    fn reload_if_changed_swaps_and_restores_tags() {
        let dir = tempdir().expect("temp dir");
        let artifact = dir.path().join("libgame_scripts.so");
        fs::write(&artifact, b"v1").expect("write artifact");
        let mut watcher = ArtifactWatcher::new(&artifact, &fast_config()).expect("watcher starts");

        let mut orchestrator = ScriptLifecycleOrchestrator::default();
        let key = watcher.artifact().to_string_lossy().into_owned();
        orchestrator.loader_mut().register_builtin(key, TypeTable::new(&TYPES));
        let mut engine = ();
        let first = orchestrator.initialize(watcher.artifact()).expect("initialise");
        orchestrator.load_systems_for_tag(&mut engine, "player").expect("load player");
        assert!(watcher.reload_if_changed(&mut orchestrator, &mut engine).is_none());

        fs::write(&artifact, b"v2").expect("rewrite artifact");
        let reloaded = wait_for(|| watcher.reload_if_changed(&mut orchestrator, &mut engine))
            .expect("rewrite triggers a reload")
            .expect("reload succeeds");
        assert!(reloaded > first);
        assert_eq!(orchestrator.active_generation(), Some(reloaded));
        assert_eq!(orchestrator.get_active_tags(), vec!["player".to_string()]);
        assert_eq!(orchestrator.get_system_count("player"), 1);

        let later =
            quiet_for(Duration::from_millis(400), || watcher.reload_if_changed(&mut orchestrator, &mut engine));
        assert_eq!(later, 0, "no further reloads without a rewrite");
        assert_eq!(orchestrator.active_generation(), Some(reloaded));
    }
}
