//! Per-source download progress.
//!
//! Each registered source carries a small state machine. Sources registered
//! with a manifest name run in `explicit` mode: the denominator is fixed. A
//! source without one starts `adaptive`: every manifest in the filemap is a
//! candidate, the widest is assumed, and observed requests narrow the
//! candidate set until the denominator matches what the embedder actually
//! loads. Filemaps without manifests degrade to `fallback` (all files).
//!
//! Two rules keep the reported percent monotonic across narrowing:
//! `loaded_bytes` never decreases, and only the denominator may shrink.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

use crate::{
    constants::{IDLE_FINALIZE_MS, PROGRESS_THROTTLE_MS},
    filemap::Filemap,
    source::Source,
    utils::Instant,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    Explicit,
    Adaptive,
    Fallback,
}

/// One progress tick, as delivered to subscribers and over the control
/// surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub file_loaded: u64,
    pub file_total: u64,
    pub loaded: u64,
    pub total: u64,
    pub percent: u8,
    pub done: bool,
    pub mode: ProgressMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

#[derive(Clone, Debug, Default)]
struct FileProgress {
    size: u64,
    loaded: u64,
}

struct SourceProgress {
    prefix: String,
    mode: ProgressMode,
    selected_manifest: Option<String>,
    candidates: Vec<String>,
    filemap: Option<Arc<Filemap>>,
    total_bytes: u64,
    loaded_bytes: u64,
    files: BTreeMap<String, FileProgress>,
    active_files: BTreeSet<String>,
    pending_fetches: usize,
    finalized: bool,
    last_file: Option<String>,
    last_percent: u8,
    last_broadcast: Option<Instant>,
    trailing_scheduled: bool,
    generation: u64,
    idle_epoch: u64,
}

impl SourceProgress {
    fn new(source: &Source, generation: u64) -> Self {
        Self {
            prefix: source.path_prefix().to_owned(),
            // Explicit pending filemap load; adaptive/fallback is decided
            // once the filemap is known.
            mode: if source.manifest.is_some() {
                ProgressMode::Explicit
            } else {
                ProgressMode::Adaptive
            },
            selected_manifest: source.manifest.clone(),
            candidates: Vec::new(),
            filemap: None,
            total_bytes: 0,
            loaded_bytes: 0,
            files: BTreeMap::new(),
            active_files: BTreeSet::new(),
            pending_fetches: 0,
            finalized: false,
            last_file: None,
            last_percent: 0,
            last_broadcast: None,
            trailing_scheduled: false,
            generation,
            idle_epoch: 0,
        }
    }

    fn percent(&self) -> u8 {
        let computed = if self.finalized {
            100
        } else if self.total_bytes == 0 {
            0
        } else {
            ((self.loaded_bytes.saturating_mul(100)) / self.total_bytes).min(100) as u8
        };
        computed.max(self.last_percent)
    }

    fn event(&self) -> ProgressEvent {
        let (file_loaded, file_total) = self
            .last_file
            .as_ref()
            .and_then(|f| self.files.get(f))
            .map(|fp| (fp.loaded, fp.size))
            .unwrap_or((0, 0));
        ProgressEvent {
            prefix: self.prefix.clone(),
            file: self.last_file.clone(),
            file_loaded,
            file_total,
            loaded: self.loaded_bytes,
            total: self.total_bytes,
            percent: self.percent(),
            done: self.finalized,
            mode: self.mode,
            manifest: self.selected_manifest.clone(),
        }
    }

    fn select_manifest(&mut self, name: &str) {
        let Some(filemap) = &self.filemap else { return };
        let Some(manifest) = filemap.manifests.get(name) else {
            return;
        };
        self.selected_manifest = Some(name.to_owned());
        self.total_bytes = manifest.size;
        let mut files = BTreeMap::new();
        for vp in &manifest.files {
            let size = filemap.entry(vp).map(|e| e.size()).unwrap_or(0);
            let loaded = self.files.get(vp).map(|fp| fp.loaded).unwrap_or(0);
            files.insert(vp.clone(), FileProgress { size, loaded });
        }
        // Requested files outside the new selection keep their accounting;
        // loaded_bytes never rolls back.
        for vp in &self.active_files {
            if !files.contains_key(vp) {
                if let Some(fp) = self.files.get(vp) {
                    files.insert(vp.clone(), fp.clone());
                }
            }
        }
        self.files = files;
    }

    fn init_from_filemap(&mut self, filemap: Arc<Filemap>) {
        self.filemap = Some(filemap.clone());
        match self.mode {
            ProgressMode::Explicit => {
                let name = self.selected_manifest.clone().unwrap_or_default();
                if filemap.manifests.contains_key(&name) {
                    self.select_manifest(&name);
                } else {
                    crate::warn!(
                        "manifest \"{name}\" not present in filemap for {}, tracking all files",
                        self.prefix
                    );
                    self.mode = ProgressMode::Fallback;
                    self.selected_manifest = None;
                    self.init_fallback(&filemap);
                }
            }
            ProgressMode::Adaptive | ProgressMode::Fallback => {
                if filemap.manifests.is_empty() {
                    self.mode = ProgressMode::Fallback;
                    self.init_fallback(&filemap);
                } else {
                    self.mode = ProgressMode::Adaptive;
                    self.candidates = filemap.manifests.keys().cloned().collect();
                    if let Some(widest) = widest_manifest(&filemap, &self.candidates) {
                        self.select_manifest(&widest);
                    }
                }
            }
        }
    }

    fn init_fallback(&mut self, filemap: &Filemap) {
        self.total_bytes = filemap.total_size();
        let mut files = BTreeMap::new();
        for (vp, entry) in &filemap.files {
            let loaded = self.files.get(vp).map(|fp| fp.loaded).unwrap_or(0);
            files.insert(
                vp.clone(),
                FileProgress {
                    size: entry.size(),
                    loaded,
                },
            );
        }
        self.files = files;
    }

    /// Narrow the candidate set with an observed request, adaptive mode
    /// only. Narrowing may shrink the denominator, never the numerator.
    /// Returns whether the candidate set actually shrank.
    fn narrow(&mut self, rel_path: &str) -> bool {
        if self.mode != ProgressMode::Adaptive || self.finalized {
            return false;
        }
        let Some(filemap) = self.filemap.clone() else {
            return false;
        };
        let matching: Vec<String> = self
            .candidates
            .iter()
            .filter(|name| {
                filemap
                    .manifests
                    .get(*name)
                    .map(|m| m.files.iter().any(|f| f == rel_path))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if matching.is_empty() || matching.len() >= self.candidates.len() {
            return false;
        }
        self.candidates = matching;
        if let Some(widest) = widest_manifest(&filemap, &self.candidates) {
            self.select_manifest(&widest);
        }
        true
    }

    /// Track an observed request. Returns true when narrowing shrank the
    /// denominator below the bytes already recorded; that overflow is the
    /// one completion the state machine may infer on its own.
    fn note_request(&mut self, rel_path: &str) -> bool {
        if self.finalized {
            return false;
        }
        let narrowed = self.narrow(rel_path);
        self.active_files.insert(rel_path.to_owned());
        self.last_file = Some(rel_path.to_owned());
        if !self.files.contains_key(rel_path) {
            let size = self
                .filemap
                .as_ref()
                .and_then(|fm| fm.entry(rel_path))
                .map(|e| e.size())
                .unwrap_or(0);
            self.files
                .insert(rel_path.to_owned(), FileProgress { size, loaded: 0 });
        }
        narrowed && self.total_bytes > 0 && self.loaded_bytes >= self.total_bytes
    }

    fn add_loaded(&mut self, rel_path: &str, bytes: u64) {
        if self.finalized {
            return;
        }
        let fp = self.files.entry(rel_path.to_owned()).or_default();
        let inc = if fp.size > 0 {
            bytes.min(fp.size.saturating_sub(fp.loaded))
        } else {
            bytes
        };
        fp.loaded += inc;
        self.loaded_bytes += inc;
        self.last_file = Some(rel_path.to_owned());
    }

    /// Shrink the denominator to the files actually requested and report
    /// completion. Exactly one `done=true` event leaves a source.
    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        let narrowed: u64 = self
            .active_files
            .iter()
            .filter_map(|vp| self.files.get(vp))
            .map(|fp| fp.size)
            .sum();
        if narrowed > 0 {
            self.total_bytes = narrowed;
        }
        for (vp, fp) in self.files.iter_mut() {
            if self.active_files.contains(vp) {
                fp.loaded = fp.size;
            }
        }
        self.loaded_bytes = self.total_bytes;
        self.finalized = true;
        self.last_percent = 100;
    }
}

fn widest_manifest(filemap: &Filemap, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|name| filemap.manifests.get(name).map(|m| (name, m.size)))
        .max_by_key(|(_, size)| *size)
        .map(|(name, _)| name.clone())
}

/// Decrements the pending-fetch counter when dropped, so every exit path of
/// a fetch balances the increment, including abandoned streams.
pub struct FetchGuard {
    registry: ProgressRegistry,
    prefix: String,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let prefix = std::mem::take(&mut self.prefix);
        crate::utils::spawn(async move {
            registry.fetch_finished(&prefix).await;
        });
    }
}

/// Owns every source's progress state and fans events out to subscribers.
#[derive(Clone)]
pub struct ProgressRegistry {
    sources: Arc<Mutex<HashMap<String, SourceProgress>>>,
    generation: Arc<Mutex<u64>>,
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            sources: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(Mutex::new(0)),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Replace all tracked sources. Stale timers from the previous set are
    /// invalidated by the generation bump.
    pub async fn reset(&self, sources: &[Source]) {
        let generation = {
            let mut g = self.generation.lock().await;
            *g += 1;
            *g
        };
        let mut map = self.sources.lock().await;
        map.clear();
        for source in sources {
            if source.progress {
                map.insert(
                    source.path_prefix().to_owned(),
                    SourceProgress::new(source, generation),
                );
            }
        }
    }

    pub async fn init_from_filemap(&self, prefix: &str, filemap: Arc<Filemap>) {
        let mut map = self.sources.lock().await;
        if let Some(state) = map.get_mut(prefix) {
            if state.filemap.is_none() {
                state.init_from_filemap(filemap);
            }
        }
    }

    pub async fn note_request(&self, prefix: &str, rel_path: &str) {
        let mut map = self.sources.lock().await;
        if let Some(state) = map.get_mut(prefix) {
            // A denominator shrink that leaves the recorded bytes at or
            // past the new total: clamp at 100 and finalize, rather than
            // rolling counters back.
            if state.note_request(rel_path) {
                state.finalize();
                self.emit(state);
            }
        }
    }

    /// Account for delivered bytes of a logical file and schedule a
    /// broadcast.
    ///
    /// Reaching 100 % is a broadcast trigger, not a finalization trigger:
    /// explicit sources finalize on the app's `complete` message, the other
    /// modes on the idle timer.
    pub async fn add_loaded(&self, prefix: &str, rel_path: &str, bytes: u64) {
        let mut map = self.sources.lock().await;
        let Some(state) = map.get_mut(prefix) else { return };
        if state.finalized {
            return;
        }
        state.add_loaded(rel_path, bytes);
        if state.percent() >= 100 && state.last_percent < 100 {
            self.emit(state);
            return;
        }
        self.throttled_emit(state);
    }

    /// A shard or proxy fetch began on behalf of this source.
    pub async fn fetch_started(&self, prefix: &str) -> Option<FetchGuard> {
        let mut map = self.sources.lock().await;
        let state = map.get_mut(prefix)?;
        state.pending_fetches += 1;
        state.idle_epoch += 1;
        Some(FetchGuard {
            registry: self.clone(),
            prefix: prefix.to_owned(),
        })
    }

    async fn fetch_finished(&self, prefix: &str) {
        let mut map = self.sources.lock().await;
        let Some(state) = map.get_mut(prefix) else { return };
        state.pending_fetches = state.pending_fetches.saturating_sub(1);
        if state.pending_fetches > 0 || state.finalized || state.mode == ProgressMode::Explicit {
            return;
        }
        // Quiet: arm the idle timer. Any new fetch bumps the epoch and the
        // armed timer lapses.
        state.idle_epoch += 1;
        let epoch = state.idle_epoch;
        let generation = state.generation;
        let prefix = prefix.to_owned();
        let registry = self.clone();
        crate::utils::spawn(async move {
            crate::utils::sleep(IDLE_FINALIZE_MS).await;
            registry.idle_fire(&prefix, generation, epoch).await;
        });
    }

    async fn idle_fire(&self, prefix: &str, generation: u64, epoch: u64) {
        let mut map = self.sources.lock().await;
        let Some(state) = map.get_mut(prefix) else { return };
        if state.generation != generation
            || state.idle_epoch != epoch
            || state.pending_fetches > 0
            || state.finalized
        {
            return;
        }
        state.finalize();
        self.emit(state);
    }

    /// Force-finalize a source (explicit `complete` control message).
    pub async fn complete(&self, prefix: &str) {
        let mut map = self.sources.lock().await;
        if let Some(state) = map.get_mut(prefix) {
            if !state.finalized {
                state.finalize();
                self.emit(state);
            }
        }
    }

    fn emit(&self, state: &mut SourceProgress) {
        state.last_percent = state.percent();
        state.last_broadcast = Some(Instant::now());
        state.trailing_scheduled = false;
        let _ = self.tx.send(state.event());
    }

    /// At most one event per throttle window per source, with a trailing
    /// emission guaranteed once the window passes.
    fn throttled_emit(&self, state: &mut SourceProgress) {
        let now = Instant::now();
        let elapsed_ms = state
            .last_broadcast
            .map(|t| now.duration_since(t).as_millis() as u64)
            .unwrap_or(u64::MAX);
        if elapsed_ms >= PROGRESS_THROTTLE_MS {
            self.emit(state);
            return;
        }
        if state.trailing_scheduled {
            return;
        }
        state.trailing_scheduled = true;
        let wait = PROGRESS_THROTTLE_MS - elapsed_ms;
        let prefix = state.prefix.clone();
        let generation = state.generation;
        let registry = self.clone();
        crate::utils::spawn(async move {
            crate::utils::sleep(wait).await;
            let mut map = registry.sources.lock().await;
            if let Some(state) = map.get_mut(&prefix) {
                if state.generation == generation && state.trailing_scheduled && !state.finalized {
                    registry.emit(state);
                }
            }
        });
    }

    /// Whether a prefix is tracked (registered with progress enabled).
    pub async fn tracks(&self, prefix: &str) -> bool {
        self.sources.lock().await.contains_key(prefix)
    }

    /// A handle bound to one source, handed to the reassembler so it can
    /// report without knowing about registration.
    pub async fn handle_for(&self, prefix: &str) -> Option<ProgressHandle> {
        self.tracks(prefix).await.then(|| ProgressHandle {
            registry: self.clone(),
            prefix: prefix.to_owned(),
        })
    }
}

/// Progress reporting scoped to a single source.
#[derive(Clone)]
pub struct ProgressHandle {
    registry: ProgressRegistry,
    prefix: String,
}

impl ProgressHandle {
    pub async fn add_loaded(&self, rel_path: &str, bytes: u64) {
        self.registry.add_loaded(&self.prefix, rel_path, bytes).await;
    }

    pub async fn guard(&self) -> Option<FetchGuard> {
        self.registry.fetch_started(&self.prefix).await
    }
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn filemap_with_manifests() -> Arc<Filemap> {
        // B strictly contains A; tok.json is shared.
        let doc = json!({
            "version": 5,
            "files": {
                "a.bin": { "size": 100, "sha256": "aa", "cdn_file": "a.bin" },
                "b.bin": { "size": 200, "sha256": "bb", "cdn_file": "b.bin" },
                "tok.json": { "size": 10, "sha256": "cc", "cdn_file": "tok.json" }
            },
            "manifests": {
                "A": { "files": ["a.bin", "tok.json"], "size": 110 },
                "B": { "files": ["a.bin", "b.bin", "tok.json"], "size": 310 }
            }
        });
        let filemap: Filemap = serde_json::from_value(doc).unwrap();
        filemap.validate().unwrap();
        Arc::new(filemap)
    }

    fn adaptive_source(dir: &std::path::Path) -> Source {
        Source::local("/m/", dir).with_progress(true)
    }

    async fn drain_last(rx: &mut broadcast::Receiver<ProgressEvent>) -> ProgressEvent {
        let mut last = rx.recv().await.unwrap();
        while let Ok(evt) = rx.try_recv() {
            last = evt;
        }
        last
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_narrowing_keeps_percent_monotonic() {
        let registry = ProgressRegistry::new();
        let dir = std::env::temp_dir();
        registry.reset(std::slice::from_ref(&adaptive_source(&dir))).await;
        registry
            .init_from_filemap("/m/", filemap_with_manifests())
            .await;
        let mut rx = registry.subscribe();

        // Widest manifest selected first.
        registry.note_request("/m/", "tok.json").await;
        registry.add_loaded("/m/", "tok.json", 10).await;
        let evt = drain_last(&mut rx).await;
        assert_eq!(evt.total, 310);
        assert_eq!(evt.manifest.as_deref(), Some("B"));
        let first_percent = evt.percent;

        // tok.json lives in both manifests, so no narrowing happened.
        {
            let map = registry.sources.lock().await;
            assert_eq!(map["/m/"].candidates.len(), 2);
        }

        // b.bin exists only in B: candidates narrow to the strict subset.
        registry.note_request("/m/", "b.bin").await;
        crate::utils::sleep(300).await;
        registry.add_loaded("/m/", "b.bin", 200).await;
        let evt = drain_last(&mut rx).await;
        assert_eq!(evt.manifest.as_deref(), Some("B"));
        assert!(evt.percent >= first_percent);
        {
            let map = registry.sources.lock().await;
            assert_eq!(map["/m/"].candidates, vec!["B".to_owned()]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn narrowing_to_subset_manifest() {
        let registry = ProgressRegistry::new();
        let dir = std::env::temp_dir();
        registry.reset(std::slice::from_ref(&adaptive_source(&dir))).await;
        // Manifest "A" alone contains only.json.
        let doc = json!({
            "version": 5,
            "files": {
                "only.json": { "size": 50, "sha256": "aa", "cdn_file": "only.json" },
                "big.bin": { "size": 250, "sha256": "bb", "cdn_file": "big.bin" }
            },
            "manifests": {
                "A": { "files": ["only.json"], "size": 50 },
                "B": { "files": ["only.json", "big.bin"], "size": 300 }
            }
        });
        let filemap: Filemap = serde_json::from_value(doc).unwrap();
        registry.init_from_filemap("/m/", Arc::new(filemap)).await;
        let mut rx = registry.subscribe();

        registry.note_request("/m/", "only.json").await;
        // only.json is in both A and B, so candidates stay at two and the
        // widest (B) is the denominator.
        registry.add_loaded("/m/", "only.json", 25).await;
        let evt = drain_last(&mut rx).await;
        assert_eq!(evt.total, 300);
        assert_eq!(evt.percent, 8);

        // Narrow by hand to a strict subset; loaded bytes survive and the
        // percent only rises.
        {
            let mut map = registry.sources.lock().await;
            let state = map.get_mut("/m/").unwrap();
            state.candidates = vec!["A".to_owned()];
            state.select_manifest("A");
            assert_eq!(state.total_bytes, 50);
            assert_eq!(state.loaded_bytes, 25);
            assert_eq!(state.percent(), 50);
        }
        registry.add_loaded("/m/", "only.json", 25).await;
        let evt = drain_last(&mut rx).await;
        assert_eq!(evt.percent, 100);
        assert!(!evt.done);

        // 100 % is a broadcast trigger, not completion; the idle timer or
        // the complete signal still owns finalization.
        registry.complete("/m/").await;
        let evt = drain_last(&mut rx).await;
        assert!(evt.done);
        assert_eq!(evt.percent, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn narrowing_overflow_finalizes() {
        let registry = ProgressRegistry::new();
        let dir = std::env::temp_dir();
        registry.reset(std::slice::from_ref(&adaptive_source(&dir))).await;
        // extra.bin belongs to no manifest; a1.bin only to A; B is widest.
        let doc = json!({
            "version": 5,
            "files": {
                "extra.bin": { "size": 80, "sha256": "aa", "cdn_file": "extra.bin" },
                "a1.bin": { "size": 30, "sha256": "bb", "cdn_file": "a1.bin" },
                "shared.bin": { "size": 20, "sha256": "cc", "cdn_file": "shared.bin" },
                "b1.bin": { "size": 200, "sha256": "dd", "cdn_file": "b1.bin" }
            },
            "manifests": {
                "A": { "files": ["a1.bin", "shared.bin"], "size": 50 },
                "B": { "files": ["shared.bin", "b1.bin"], "size": 220 }
            }
        });
        let filemap: Filemap = serde_json::from_value(doc).unwrap();
        filemap.validate().unwrap();
        registry.init_from_filemap("/m/", Arc::new(filemap)).await;
        let mut rx = registry.subscribe();

        registry.note_request("/m/", "extra.bin").await;
        registry.add_loaded("/m/", "extra.bin", 80).await;
        let evt = drain_last(&mut rx).await;
        assert_eq!(evt.total, 220);
        assert!(!evt.done);

        // Requesting an A-only file narrows the denominator to 50, below
        // the 80 bytes already recorded: clamp at 100 and finalize.
        registry.note_request("/m/", "a1.bin").await;
        let evt = drain_last(&mut rx).await;
        assert!(evt.done);
        assert_eq!(evt.percent, 100);
        assert_eq!(evt.manifest.as_deref(), Some("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_finalization_narrows_denominator() {
        let registry = ProgressRegistry::new();
        let dir = std::env::temp_dir();
        registry.reset(std::slice::from_ref(&adaptive_source(&dir))).await;
        registry
            .init_from_filemap("/m/", filemap_with_manifests())
            .await;
        let mut rx = registry.subscribe();

        registry.note_request("/m/", "tok.json").await;
        let guard = registry.fetch_started("/m/").await.unwrap();
        registry.add_loaded("/m/", "tok.json", 10).await;
        drop(guard);

        // 2 s of silence finalizes with the denominator shrunk to the one
        // requested file.
        crate::utils::sleep(IDLE_FINALIZE_MS + 500).await;
        let mut done_evt = None;
        while let Ok(evt) = rx.try_recv() {
            if evt.done {
                done_evt = Some(evt);
            }
        }
        let evt = done_evt.expect("finalization event");
        assert_eq!(evt.total, 10);
        assert_eq!(evt.percent, 100);

        // Finalized sources emit nothing further.
        registry.add_loaded("/m/", "a.bin", 50).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_mode_never_idle_finalizes() {
        let registry = ProgressRegistry::new();
        let dir = std::env::temp_dir();
        let source = Source::local("/m/", &dir)
            .with_manifest(Some("A".to_owned()))
            .with_progress(true);
        registry.reset(std::slice::from_ref(&source)).await;
        registry
            .init_from_filemap("/m/", filemap_with_manifests())
            .await;
        let mut rx = registry.subscribe();

        registry.note_request("/m/", "tok.json").await;
        let guard = registry.fetch_started("/m/").await.unwrap();
        registry.add_loaded("/m/", "tok.json", 10).await;
        drop(guard);
        crate::utils::sleep(IDLE_FINALIZE_MS * 2).await;
        while let Ok(evt) = rx.try_recv() {
            assert!(!evt.done);
        }

        // Streaming every byte of the manifest reports 100 % but does not
        // finalize; that stays the app's call.
        registry.note_request("/m/", "a.bin").await;
        registry.add_loaded("/m/", "a.bin", 100).await;
        let evt = drain_last(&mut rx).await;
        assert_eq!(evt.percent, 100);
        assert!(!evt.done);
        crate::utils::sleep(IDLE_FINALIZE_MS * 2).await;
        assert!(rx.try_recv().is_err());

        // The explicit complete signal finalizes.
        registry.complete("/m/").await;
        let evt = drain_last(&mut rx).await;
        assert!(evt.done);
        assert_eq!(evt.percent, 100);
        assert_eq!(evt.mode, ProgressMode::Explicit);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_explicit_manifest_degrades_to_fallback() {
        let registry = ProgressRegistry::new();
        let dir = std::env::temp_dir();
        let source = Source::local("/m/", &dir)
            .with_manifest(Some("nope".to_owned()))
            .with_progress(true);
        registry.reset(std::slice::from_ref(&source)).await;
        registry
            .init_from_filemap("/m/", filemap_with_manifests())
            .await;
        let mut rx = registry.subscribe();
        registry.note_request("/m/", "a.bin").await;
        registry.add_loaded("/m/", "a.bin", 100).await;
        let evt = drain_last(&mut rx).await;
        assert_eq!(evt.mode, ProgressMode::Fallback);
        assert_eq!(evt.total, 310);
        assert_eq!(evt.manifest, None);
    }
}
