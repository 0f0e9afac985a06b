#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use slide_kiosk::bundle::{BundleCache, BundleFetcher};
use slide_kiosk::config::LockPolicy;
use slide_kiosk::content::{BundleContentLoader, ContentHandle, ContentLoader, LoadedContent};
use slide_kiosk::error::SlideError;
use slide_kiosk::events::CurrentSlideChanged;
use slide_kiosk::registry::SlideRegistry;
use slide_kiosk::renderer::{AnimationSignal, Renderer};
use slide_kiosk::slide::{SlideId, SlideMetadata, TransitionKind};
use slide_kiosk::tasks::show::{self, ShowOptions};
use slide_kiosk::SlideLifecycleManager;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// In-memory bundle source counting fetches per URL.
#[derive(Default)]
pub struct MemoryFetcher {
    bundles: Mutex<HashMap<String, Vec<u8>>>,
    fetches: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
}

impl MemoryFetcher {
    /// Every later fetch takes `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn put(&self, url: &str, bytes: Vec<u8>) {
        self.bundles.lock().insert(url.to_string(), bytes);
    }

    pub fn fetches(&self, url: &str) -> usize {
        self.fetches.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.fetches.lock().values().sum()
    }
}

#[async_trait]
impl BundleFetcher for MemoryFetcher {
    async fn fetch(&self, id: &SlideId, url: &str) -> Result<Vec<u8>, SlideError> {
        *self.fetches.lock().entry(url.to_string()).or_default() += 1;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.bundles
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| SlideError::fetch(id, url, "404 not found"))
    }
}

pub fn zip_bundle(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in files {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn layout_bundle(title: &str) -> Vec<u8> {
    let layout = format!(r#"{{"title": "{title}"}}"#);
    zip_bundle(&[("layout.json", &layout), ("assets/readme.txt", title)])
}

pub fn meta(id: &str, url: &str, duration: f64, timestamp: &str) -> SlideMetadata {
    SlideMetadata {
        id: SlideId::new(id),
        url: url.to_string(),
        duration,
        priority: 0,
        transition: TransitionKind::Fade,
        timestamp: timestamp.into(),
        mode: SlideMetadata::DEFAULT_MODE.to_string(),
    }
}

/// Default loader plus load/release counters.
#[derive(Default)]
pub struct CountingLoader {
    inner: BundleContentLoader,
    pub loads: AtomicUsize,
    pub releases: AtomicUsize,
}

impl CountingLoader {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl ContentLoader for CountingLoader {
    fn load(&self, id: &SlideId, dir: &Path, mode: &str) -> Result<LoadedContent, SlideError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(id, dir, mode)
    }

    fn release(&self, id: &SlideId, content: LoadedContent) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(id, content);
    }
}

/// What the renderer currently shows.
#[derive(Default)]
pub struct Screen {
    attached: Mutex<Vec<(SlideId, ContentHandle)>>,
    max_attached: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl Screen {
    pub fn attached(&self) -> Vec<SlideId> {
        self.attached.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn attached_handle(&self, id: &SlideId) -> Option<ContentHandle> {
        self.attached
            .lock()
            .iter()
            .find(|(attached, _)| attached == id)
            .map(|(_, handle)| handle.clone())
    }

    pub fn max_attached(&self) -> usize {
        self.max_attached.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

pub struct ScreenRenderer {
    screen: Arc<Screen>,
    animation: Duration,
}

impl ScreenRenderer {
    pub fn new(screen: Arc<Screen>, animation: Duration) -> Self {
        Self { screen, animation }
    }

    fn animate(&self) -> AnimationSignal {
        let (tx, rx) = oneshot::channel();
        if self.animation.is_zero() {
            let _ = tx.send(());
        } else {
            let delay = self.animation;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(());
            });
        }
        rx
    }
}

impl Renderer for ScreenRenderer {
    fn attach(&mut self, id: &SlideId, content: &ContentHandle) {
        let mut attached = self.screen.attached.lock();
        attached.push((id.clone(), content.clone()));
        self.screen
            .max_attached
            .fetch_max(attached.len(), Ordering::SeqCst);
        self.screen.log.lock().push(format!("attach {id}"));
    }

    fn detach(&mut self, id: &SlideId, content: &ContentHandle) {
        self.screen
            .attached
            .lock()
            .retain(|(attached, handle)| !(attached == id && handle.same_as(content)));
        self.screen.log.lock().push(format!("detach {id}"));
    }

    fn play_intro(&mut self, id: &SlideId, _content: &ContentHandle, _kind: TransitionKind) -> AnimationSignal {
        self.screen.log.lock().push(format!("intro {id}"));
        self.animate()
    }

    fn play_outro(&mut self, id: &SlideId, _content: &ContentHandle, _kind: TransitionKind) -> AnimationSignal {
        self.screen.log.lock().push(format!("outro {id}"));
        self.animate()
    }
}

pub fn fast_lock_policy() -> LockPolicy {
    LockPolicy {
        attempts: 40,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(50),
        warn_after: 10,
    }
}

/// A running show loop wired to a manager, with in-memory collaborators.
pub struct Harness {
    pub manager: SlideLifecycleManager,
    pub registry: SlideRegistry,
    pub fetcher: Arc<MemoryFetcher>,
    pub loader: Arc<CountingLoader>,
    pub screen: Arc<Screen>,
    pub cache: Arc<BundleCache>,
    cancel: CancellationToken,
    show: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    pub fn start(cache_dir: &Path) -> Self {
        Self::with(cache_dir, ShowOptions::default(), fast_lock_policy(), Duration::from_millis(20))
    }

    pub fn with(cache_dir: &Path, options: ShowOptions, policy: LockPolicy, animation: Duration) -> Self {
        let fetcher = Arc::new(MemoryFetcher::default());
        let loader = Arc::new(CountingLoader::default());
        let screen = Arc::new(Screen::default());
        let cache = Arc::new(BundleCache::new(
            PathBuf::from(cache_dir),
            Arc::clone(&fetcher) as Arc<dyn BundleFetcher>,
        ));
        let registry = SlideRegistry::new();
        let (show_tx, show_rx) = mpsc::channel(32);
        let (events_tx, _) = broadcast::channel::<CurrentSlideChanged>(32);
        let cancel = CancellationToken::new();

        let show = tokio::spawn(show::run(
            options,
            registry.clone(),
            ScreenRenderer::new(Arc::clone(&screen), animation),
            show_rx,
            events_tx.clone(),
            cancel.clone(),
        ));
        let manager = SlideLifecycleManager::new(
            registry.clone(),
            Arc::clone(&cache),
            Arc::clone(&loader) as Arc<dyn ContentLoader>,
            show_tx,
            events_tx,
            policy,
        );
        Self {
            manager,
            registry,
            fetcher,
            loader,
            screen,
            cache,
            cancel,
            show,
        }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.show.await;
    }
}

pub async fn next_change(rx: &mut broadcast::Receiver<CurrentSlideChanged>) -> SlideId {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for CurrentSlideChanged")
        .expect("event channel closed")
        .0
}
