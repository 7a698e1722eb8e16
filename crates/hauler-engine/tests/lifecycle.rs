//! End-to-end lifecycle scenarios driven through the real store,
//! resolver, dispatcher, and monitor, with the provider and download
//! executor stubbed at their trait seams.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hauler_config::Settings;
use hauler_core::{CancelFlag, FileState, TaskMode, TaskStatus};
use hauler_data::TaskStore;
use hauler_engine::{
    AdmissionController, CancelRegistry, Dispatcher, DiskProbe, ProgressMonitor, Resolver,
    ServiceError, SubmitRequest, TaskService,
};
use hauler_events::{Event, EventBus, EventStream};
use hauler_fetch::{DownloadExecutor, FetchError, FetchOutcome, FetchRequest, UrlRefresh};
use hauler_provider::{ProviderClient, ProviderError, ProviderFile, ProviderPoll};
use tempfile::TempDir;
use uuid::Uuid;

const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";

// ---------------------------------------------------------------------
// Stubs
// ---------------------------------------------------------------------

struct StubProvider {
    polls: Mutex<VecDeque<Result<ProviderPoll, ProviderError>>>,
    status_calls: AtomicUsize,
    unlock_calls: AtomicUsize,
}

impl StubProvider {
    fn new(polls: Vec<Result<ProviderPoll, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            polls: Mutex::new(polls.into()),
            status_calls: AtomicUsize::new(0),
            unlock_calls: AtomicUsize::new(0),
        })
    }

    fn manifest(files: &[(&str, u64)]) -> ProviderPoll {
        ProviderPoll {
            files: files
                .iter()
                .map(|(name, size)| ProviderFile {
                    name: (*name).to_owned(),
                    size: *size,
                    locked_url: Some(format!("locked://{name}")),
                })
                .collect(),
            terminal_error: None,
        }
    }
}

#[async_trait]
impl ProviderClient for StubProvider {
    async fn upload(&self, _source: &str) -> Result<String, ProviderError> {
        Ok("ref-1".to_owned())
    }

    async fn status(&self, _provider_ref: &str) -> Result<ProviderPoll, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut polls = self.polls.lock().unwrap();
        polls.pop_front().unwrap_or_else(|| Ok(ProviderPoll::default()))
    }

    async fn unlock(&self, locked_url: &str) -> Result<String, ProviderError> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://dl.example/{locked_url}"))
    }
}

/// Materialises the whole file immediately; the monitor then observes
/// the finished artifact.
struct WritingExecutor;

#[async_trait]
impl DownloadExecutor for WritingExecutor {
    async fn fetch(
        &self,
        request: FetchRequest,
        _cancel: CancelFlag,
        _refresh: Option<Arc<dyn UrlRefresh>>,
    ) -> Result<FetchOutcome, FetchError> {
        tokio::fs::create_dir_all(&request.dir).await?;
        let size = usize::try_from(request.expected_size.unwrap_or(4)).unwrap();
        let path = request.dir.join(&request.file_name);
        tokio::fs::write(&path, vec![0_u8; size]).await?;
        Ok(FetchOutcome {
            bytes_written: size as u64,
            path,
        })
    }
}

/// Writes a small partial plus a sidecar recording its byte count,
/// then parks until canceled.
struct StallingExecutor {
    partial_bytes: usize,
}

#[async_trait]
impl DownloadExecutor for StallingExecutor {
    async fn fetch(
        &self,
        request: FetchRequest,
        cancel: CancelFlag,
        _refresh: Option<Arc<dyn UrlRefresh>>,
    ) -> Result<FetchOutcome, FetchError> {
        tokio::fs::create_dir_all(&request.dir).await?;
        let path = request.dir.join(&request.file_name);
        tokio::fs::write(
            hauler_core::control_path(&path),
            self.partial_bytes.to_string(),
        )
        .await?;
        tokio::fs::write(&path, vec![1_u8; self.partial_bytes]).await?;
        loop {
            if cancel.is_set() {
                return Err(FetchError::Canceled);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Disk probe with unlimited free space for deterministic admission.
struct HugeProbe;

impl DiskProbe for HugeProbe {
    fn free_bytes(&self, _root: &Path) -> u64 {
        u64::MAX
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

struct Harness {
    _tmp: TempDir,
    settings: Arc<Settings>,
    store: TaskStore,
    bus: EventBus,
    provider: Arc<StubProvider>,
    resolver: Arc<Resolver>,
    dispatcher: Dispatcher,
    monitor: ProgressMonitor,
    service: TaskService,
}

async fn harness(
    provider: Arc<StubProvider>,
    executor: Arc<dyn DownloadExecutor>,
    tune: impl FnOnce(&mut Settings),
) -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let mut settings = Settings::default();
    settings.storage.root = tmp.path().to_owned();
    settings.storage.low_space_floor_gb = 0;
    settings.timing.resolve_poll_secs = 0;
    settings.timing.max_resolve_attempts = 5;
    tune(&mut settings);
    let settings = Arc::new(settings);

    let bus = EventBus::with_capacity(256);
    let store = TaskStore::in_memory(bus.clone()).await.expect("store");
    let cancels = CancelRegistry::new();
    let admission = AdmissionController::new(
        Arc::new(HugeProbe),
        settings.storage.root.clone(),
        settings.storage.floor_bytes(),
    );
    let resolver = Arc::new(Resolver::new(
        store.clone(),
        provider.clone(),
        cancels.clone(),
        settings.clone(),
    ));
    let dispatcher = Dispatcher::new(
        store.clone(),
        provider.clone(),
        executor,
        admission,
        cancels.clone(),
        settings.clone(),
    );
    let monitor = ProgressMonitor::new(store.clone(), settings.clone());
    let service = TaskService::new(store.clone(), cancels, settings.clone());

    Harness {
        _tmp: tmp,
        settings,
        store,
        bus,
        provider,
        resolver,
        dispatcher,
        monitor,
        service,
    }
}

impl Harness {
    async fn submit_magnet(&self, mode: TaskMode) -> Uuid {
        let outcome = self
            .service
            .submit(SubmitRequest {
                source: MAGNET.to_owned(),
                mode,
                label: Some("demo".to_owned()),
                owner: None,
            })
            .await
            .expect("submit");
        assert!(!outcome.reused);
        assert_eq!(outcome.status, TaskStatus::Queued);
        outcome.task_id
    }

    async fn resolve(&self, task_id: Uuid) {
        let task = self.store.get_task(task_id).await.unwrap().unwrap();
        self.resolver.resolve_task(&task).await.expect("resolve");
    }

    async fn status(&self, task_id: Uuid) -> TaskStatus {
        self.store.get_task(task_id).await.unwrap().unwrap().status
    }
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the wait budget");
}

async fn collect_until_status(
    stream: &mut EventStream,
    status: TaskStatus,
) -> Vec<String> {
    let mut kinds = Vec::new();
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        kinds.push(envelope.event.kind().to_owned());
        if matches!(envelope.event, Event::State { status: s, .. } if s == status) {
            return kinds;
        }
    }
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn auto_mode_happy_path_single_file() {
    let provider = StubProvider::new(vec![
        Ok(ProviderPoll::default()), // manifest not ready on the first poll
        Ok(StubProvider::manifest(&[("a.bin", 1024)])),
    ]);
    let h = harness(provider, Arc::new(WritingExecutor), |_| {}).await;

    let task_id = h.submit_magnet(TaskMode::Auto).await;
    let mut stream = h.bus.subscribe(task_id, Some(0));

    h.resolve(task_id).await;
    assert_eq!(h.status(task_id).await, TaskStatus::Downloading);
    assert_eq!(h.provider.status_calls.load(Ordering::SeqCst), 2);

    h.dispatcher.tick().await.unwrap();
    let artifact = h
        .settings
        .storage
        .root
        .join(task_id.to_string())
        .join("files")
        .join("a.bin");
    wait_for(|| artifact.metadata().map(|m| m.len()).unwrap_or(0) == 1024).await;

    h.monitor.tick().await.unwrap();
    h.dispatcher.tick().await.unwrap();
    assert_eq!(h.status(task_id).await, TaskStatus::Ready);

    let kinds = collect_until_status(&mut stream, TaskStatus::Ready).await;
    assert_eq!(
        kinds,
        vec![
            "hello",
            "state",         // resolving
            "files.listed",
            "state",         // downloading
            "file.state",    // downloading
            "file.progress", // 1024 bytes observed
            "file.done",
            "state",         // ready
        ]
    );

    let files = h.store.files_for_task(task_id).await.unwrap();
    assert_eq!(files[0].state, FileState::Done);
    assert_eq!(files[0].bytes_downloaded, 1024);
    assert!(files[0].local_path.as_deref().unwrap().ends_with("a.bin"));
}

#[tokio::test]
async fn select_mode_times_out_into_cancel() {
    let provider = StubProvider::new(vec![Ok(StubProvider::manifest(&[
        ("a.bin", 100),
        ("b.bin", 200),
        ("c.bin", 300),
    ]))]);
    let h = harness(provider, Arc::new(WritingExecutor), |s| {
        s.timing.selection_timeout_minutes = 0;
    })
    .await;

    let task_id = h.submit_magnet(TaskMode::Select).await;
    h.resolve(task_id).await;
    assert_eq!(h.status(task_id).await, TaskStatus::WaitingSelection);

    let mut stream = h.bus.subscribe(task_id, Some(0));
    h.resolver.sweep_selection_timeouts().await.unwrap();
    assert_eq!(h.status(task_id).await, TaskStatus::Canceled);

    // the terminal state event carries the timeout reason
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream closed");
        if let Event::State { status, reason, .. } = envelope.event {
            if status == TaskStatus::Canceled {
                assert_eq!(reason.as_deref(), Some("selection_timeout"));
                break;
            }
        }
    }
}

#[tokio::test]
async fn select_mode_partial_selection_downloads_chosen_files() {
    let provider = StubProvider::new(vec![Ok(StubProvider::manifest(&[
        ("a.bin", 100),
        ("b.bin", 200),
        ("c.bin", 300),
    ]))]);
    let h = harness(provider, Arc::new(WritingExecutor), |_| {}).await;

    let task_id = h.submit_magnet(TaskMode::Select).await;
    h.resolve(task_id).await;

    let files = h.store.files_for_task(task_id).await.unwrap();
    let chosen: Vec<Uuid> = vec![files[0].id, files[2].id];
    let status = h.service.select(task_id, &chosen).await.unwrap();
    assert_eq!(status, TaskStatus::Downloading);

    h.dispatcher.tick().await.unwrap();
    for name in ["a.bin", "c.bin"] {
        let path = h
            .settings
            .storage
            .root
            .join(task_id.to_string())
            .join("files")
            .join(name);
        wait_for(|| path.exists()).await;
    }
    h.monitor.tick().await.unwrap();
    h.dispatcher.tick().await.unwrap();
    assert_eq!(h.status(task_id).await, TaskStatus::Ready);

    // selecting again is rejected
    let err = h.service.select(task_id, &chosen).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidState(_)));
}

#[tokio::test]
async fn dedup_shortcut_completes_without_provider_calls() {
    let provider = StubProvider::new(vec![]);
    let h = harness(provider, Arc::new(WritingExecutor), |_| {}).await;

    let identifier = "0123456789abcdef0123456789abcdef01234567";
    h.store.dedup_record(identifier, "existing-share").await.unwrap();
    std::fs::create_dir_all(h.settings.storage.root.join("existing-share")).unwrap();

    let task_id = h.submit_magnet(TaskMode::Auto).await;
    h.resolve(task_id).await;

    assert_eq!(h.status(task_id).await, TaskStatus::Ready);
    assert_eq!(h.provider.status_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.provider.unlock_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_dedup_entry_falls_through_to_resolution() {
    let provider = StubProvider::new(vec![Ok(StubProvider::manifest(&[("a.bin", 8)]))]);
    let h = harness(provider, Arc::new(WritingExecutor), |_| {}).await;

    let identifier = "0123456789abcdef0123456789abcdef01234567";
    // index entry whose share directory no longer exists
    h.store.dedup_record(identifier, "vanished-share").await.unwrap();

    let task_id = h.submit_magnet(TaskMode::Auto).await;
    h.resolve(task_id).await;
    assert_eq!(h.status(task_id).await, TaskStatus::Downloading);
    assert!(h.provider.status_calls.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn provider_terminal_failure_fails_the_task() {
    let provider = StubProvider::new(vec![Ok(ProviderPoll {
        files: Vec::new(),
        terminal_error: Some("magnet_dead: no peers".to_owned()),
    })]);
    let h = harness(provider, Arc::new(WritingExecutor), |_| {}).await;

    let task_id = h.submit_magnet(TaskMode::Auto).await;
    let mut stream = h.bus.subscribe(task_id, Some(0));
    h.resolve(task_id).await;

    assert_eq!(h.status(task_id).await, TaskStatus::Failed);
    assert!(h.store.files_for_task(task_id).await.unwrap().is_empty());

    let mut saw_resolving = false;
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream closed");
        match envelope.event {
            Event::State {
                status: TaskStatus::Resolving,
                ..
            } => saw_resolving = true,
            Event::State {
                status: TaskStatus::Failed,
                reason,
                ..
            } => {
                assert!(reason.unwrap().contains("magnet_dead"));
                break;
            }
            _ => {}
        }
    }
    assert!(saw_resolving);
}

#[tokio::test]
async fn resolve_timeout_exhausts_into_failed() {
    // every poll returns an empty manifest
    let provider = StubProvider::new(vec![]);
    let h = harness(provider, Arc::new(WritingExecutor), |s| {
        s.timing.max_resolve_attempts = 3;
    })
    .await;

    let task_id = h.submit_magnet(TaskMode::Auto).await;
    h.resolve(task_id).await;

    assert_eq!(h.status(task_id).await, TaskStatus::Failed);
    assert_eq!(h.provider.status_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn per_task_cap_bounds_concurrent_downloads() {
    const GIB: u64 = 1024 * 1024 * 1024;
    let provider = StubProvider::new(vec![Ok(StubProvider::manifest(&[
        ("f0.bin", GIB),
        ("f1.bin", GIB),
        ("f2.bin", GIB),
        ("f3.bin", GIB),
        ("f4.bin", GIB),
    ]))]);
    let h = harness(
        provider,
        Arc::new(StallingExecutor { partial_bytes: 16 }),
        |s| {
            s.concurrency.per_task_max_active = 2;
        },
    )
    .await;

    let task_id = h.submit_magnet(TaskMode::Auto).await;
    h.resolve(task_id).await;

    h.dispatcher.tick().await.unwrap();
    let count_states = |files: &[hauler_core::TaskFileRecord], state: FileState| {
        files.iter().filter(|f| f.state == state).count()
    };
    let files = h.store.files_for_task(task_id).await.unwrap();
    assert_eq!(count_states(&files, FileState::Downloading), 2);
    assert_eq!(count_states(&files, FileState::Selected), 3);

    // further cycles never exceed the cap while the two stall
    h.dispatcher.tick().await.unwrap();
    h.dispatcher.tick().await.unwrap();
    let files = h.store.files_for_task(task_id).await.unwrap();
    assert_eq!(count_states(&files, FileState::Downloading), 2);
    assert_eq!(h.store.global_downloading_count().await.unwrap(), 2);

    // unblock the parked executors
    h.service.cancel(task_id).await.unwrap();
}

#[tokio::test]
async fn cancel_mid_download_freezes_progress_and_purge_removes_files() {
    let provider = StubProvider::new(vec![Ok(StubProvider::manifest(&[("big.bin", 100)]))]);
    let h = harness(
        provider,
        Arc::new(StallingExecutor { partial_bytes: 10 }),
        |_| {},
    )
    .await;

    let task_id = h.submit_magnet(TaskMode::Auto).await;
    h.resolve(task_id).await;
    h.dispatcher.tick().await.unwrap();

    let artifact = h
        .settings
        .storage
        .root
        .join(task_id.to_string())
        .join("files")
        .join("big.bin");
    wait_for(|| artifact.exists()).await;

    h.monitor.tick().await.unwrap();
    let files = h.store.files_for_task(task_id).await.unwrap();
    assert_eq!(files[0].bytes_downloaded, 10);
    assert_eq!(files[0].state, FileState::Downloading);

    let status = h.service.cancel(task_id).await.unwrap();
    assert_eq!(status, TaskStatus::Canceled);

    // the dispatcher skips canceled tasks; nothing else starts
    h.dispatcher.tick().await.unwrap();
    let files = h.store.files_for_task(task_id).await.unwrap();
    assert_eq!(files[0].bytes_downloaded, 10);

    // the partial artifact survives cancellation
    assert!(artifact.exists());

    h.service.delete(task_id, true).await.unwrap();
    assert!(!artifact.exists());
    assert!(h.store.get_task(task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn resubmitting_a_live_source_reuses_the_task() {
    let provider = StubProvider::new(vec![]);
    let h = harness(provider, Arc::new(WritingExecutor), |_| {}).await;

    let first = h.submit_magnet(TaskMode::Auto).await;
    let second = h
        .service
        .submit(SubmitRequest {
            source: MAGNET.to_owned(),
            mode: TaskMode::Auto,
            label: None,
            owner: None,
        })
        .await
        .unwrap();
    assert!(second.reused);
    assert_eq!(second.task_id, first);

    let (_, total) = h.service.list(None, 100, 0).await.unwrap();
    assert_eq!(total, 1);

    // a canceled task is not reusable; resubmission creates a new row
    h.service.cancel(first).await.unwrap();
    let third = h
        .service
        .submit(SubmitRequest {
            source: MAGNET.to_owned(),
            mode: TaskMode::Auto,
            label: None,
            owner: None,
        })
        .await
        .unwrap();
    assert!(!third.reused);
    assert_ne!(third.task_id, first);
}

#[tokio::test]
async fn colliding_manifest_names_get_their_own_artifacts() {
    // both entries sanitise to "a_b.mkv"
    let provider = StubProvider::new(vec![Ok(StubProvider::manifest(&[
        ("a/b.mkv", 100),
        ("a_b.mkv", 200),
    ]))]);
    let h = harness(provider, Arc::new(WritingExecutor), |_| {}).await;

    let task_id = h.submit_magnet(TaskMode::Auto).await;
    h.resolve(task_id).await;

    let files = h.store.files_for_task(task_id).await.unwrap();
    assert_eq!(files[0].name, "a_b.mkv");
    assert_eq!(files[1].name, "a_b.1.mkv");

    h.dispatcher.tick().await.unwrap();
    let files_dir = h
        .settings
        .storage
        .root
        .join(task_id.to_string())
        .join("files");
    wait_for(|| {
        files_dir.join("a_b.mkv").metadata().map(|m| m.len()).unwrap_or(0) == 100
            && files_dir.join("a_b.1.mkv").metadata().map(|m| m.len()).unwrap_or(0) == 200
    })
    .await;

    h.monitor.tick().await.unwrap();
    h.dispatcher.tick().await.unwrap();
    assert_eq!(h.status(task_id).await, TaskStatus::Ready);

    let files = h.store.files_for_task(task_id).await.unwrap();
    assert_eq!(files[0].bytes_downloaded, 100);
    assert_eq!(files[1].bytes_downloaded, 200);
    assert!(files[0].local_path.as_deref().unwrap().ends_with("a_b.mkv"));
    assert!(files[1].local_path.as_deref().unwrap().ends_with("a_b.1.mkv"));
}

#[tokio::test]
async fn preallocated_output_is_not_mistaken_for_progress() {
    /// Pre-allocates the full output up front (as the segmented HTTP
    /// path does), records real payload progress in the sidecar, and
    /// parks until canceled.
    struct PreallocatingExecutor {
        payload_bytes: u64,
    }

    #[async_trait]
    impl DownloadExecutor for PreallocatingExecutor {
        async fn fetch(
            &self,
            request: FetchRequest,
            cancel: CancelFlag,
            _refresh: Option<Arc<dyn UrlRefresh>>,
        ) -> Result<FetchOutcome, FetchError> {
            tokio::fs::create_dir_all(&request.dir).await?;
            let path = request.dir.join(&request.file_name);
            // sidecar first, as the real executor does
            tokio::fs::write(
                hauler_core::control_path(&path),
                self.payload_bytes.to_string(),
            )
            .await?;
            let file = tokio::fs::File::create(&path).await?;
            file.set_len(request.expected_size.unwrap_or(0)).await?;
            drop(file);
            loop {
                if cancel.is_set() {
                    return Err(FetchError::Canceled);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    let provider = StubProvider::new(vec![Ok(StubProvider::manifest(&[("big.bin", 10_000)]))]);
    let h = harness(
        provider,
        Arc::new(PreallocatingExecutor { payload_bytes: 250 }),
        |_| {},
    )
    .await;

    let task_id = h.submit_magnet(TaskMode::Auto).await;
    h.resolve(task_id).await;
    h.dispatcher.tick().await.unwrap();

    let artifact = h
        .settings
        .storage
        .root
        .join(task_id.to_string())
        .join("files")
        .join("big.bin");
    wait_for(|| artifact.metadata().map(|m| m.len()).unwrap_or(0) == 10_000).await;

    h.monitor.tick().await.unwrap();
    let files = h.store.files_for_task(task_id).await.unwrap();
    // the full-length pre-allocation must not read as completion
    assert_eq!(files[0].state, FileState::Downloading);
    assert_eq!(files[0].bytes_downloaded, 250);

    // the reservation still accounts for the undelivered bytes
    assert_eq!(h.store.reserved_bytes_for(task_id).await.unwrap(), 9_750);

    h.service.cancel(task_id).await.unwrap();
}

#[tokio::test]
async fn direct_upload_lands_ready_without_the_provider() {
    let provider = StubProvider::new(vec![]);
    let h = harness(provider, Arc::new(WritingExecutor), |_| {}).await;

    let staged = h.settings.storage.root.join("incoming.dat");
    std::fs::write(&staged, b"uploaded-bytes").unwrap();

    let outcome = h
        .service
        .submit_upload(&staged, "My Upload (1).dat", None, None)
        .await
        .unwrap();
    assert!(!outcome.reused);
    assert_eq!(outcome.status, TaskStatus::Ready);

    let detail = h.service.get(outcome.task_id).await.unwrap();
    assert_eq!(detail.files.len(), 1);
    assert_eq!(detail.files[0].state, FileState::Done);
    assert_eq!(detail.files[0].bytes_downloaded, 14);
    let local = detail.files[0].local_path.as_deref().unwrap();
    assert_eq!(std::fs::read(local).unwrap(), b"uploaded-bytes");
    assert!(!staged.exists());
    assert_eq!(h.provider.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unlock_failure_fails_the_file_and_then_the_task() {
    struct FailingUnlock(Arc<StubProvider>);

    #[async_trait]
    impl ProviderClient for FailingUnlock {
        async fn upload(&self, source: &str) -> Result<String, ProviderError> {
            self.0.upload(source).await
        }
        async fn status(&self, provider_ref: &str) -> Result<ProviderPoll, ProviderError> {
            self.0.status(provider_ref).await
        }
        async fn unlock(&self, _locked_url: &str) -> Result<String, ProviderError> {
            Err(ProviderError::Terminal("LINK_DOWN: gone".to_owned()))
        }
    }

    let inner = StubProvider::new(vec![Ok(StubProvider::manifest(&[("a.bin", 64)]))]);
    let tmp = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.storage.root = tmp.path().to_owned();
    settings.storage.low_space_floor_gb = 0;
    settings.timing.resolve_poll_secs = 0;
    let settings = Arc::new(settings);

    let bus = EventBus::with_capacity(64);
    let store = TaskStore::in_memory(bus.clone()).await.unwrap();
    let cancels = CancelRegistry::new();
    let admission = AdmissionController::new(
        Arc::new(HugeProbe),
        settings.storage.root.clone(),
        settings.storage.floor_bytes(),
    );
    let provider: Arc<dyn ProviderClient> = Arc::new(FailingUnlock(inner));
    let resolver = Resolver::new(
        store.clone(),
        provider.clone(),
        cancels.clone(),
        settings.clone(),
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        provider,
        Arc::new(WritingExecutor),
        admission,
        cancels.clone(),
        settings.clone(),
    );
    let service = TaskService::new(store.clone(), cancels, settings);

    let outcome = service
        .submit(SubmitRequest {
            source: MAGNET.to_owned(),
            mode: TaskMode::Auto,
            label: None,
            owner: None,
        })
        .await
        .unwrap();
    let task = store.get_task(outcome.task_id).await.unwrap().unwrap();
    resolver.resolve_task(&task).await.unwrap();

    h_tick(&dispatcher).await; // unlock fails, file -> failed
    h_tick(&dispatcher).await; // completion check -> task failed

    let files = store.files_for_task(outcome.task_id).await.unwrap();
    assert_eq!(files[0].state, FileState::Failed);
    let task = store.get_task(outcome.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

async fn h_tick(dispatcher: &Dispatcher) {
    dispatcher.tick().await.unwrap();
}
