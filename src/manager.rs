use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio::sync::{OwnedMutexGuard, broadcast, oneshot};
use tokio::task;
use tokio::time::sleep;
use tracing::{Instrument, debug, info, instrument, warn};

use crate::bundle::BundleCache;
use crate::config::LockPolicy;
use crate::content::{ContentLoader, LoadedContent};
use crate::error::SlideError;
use crate::events::{CurrentSlideChanged, ShowCommand, ShowStatus};
use crate::registry::SlideRegistry;
use crate::slide::{LifecycleState, Slide, SlideId, SlideMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    /// The slide disappeared while we waited for its lock.
    Vanished,
}

/// Entry point for remote slide mutations.
///
/// Fetching and parsing happen in the caller's task (parsing on a blocking
/// worker); every change to what is shown goes through the show loop.
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct SlideLifecycleManager {
    registry: SlideRegistry,
    cache: Arc<BundleCache>,
    loader: Arc<dyn ContentLoader>,
    show: Sender<ShowCommand>,
    events: broadcast::Sender<CurrentSlideChanged>,
    lock_policy: LockPolicy,
}

impl SlideLifecycleManager {
    pub fn new(
        registry: SlideRegistry,
        cache: Arc<BundleCache>,
        loader: Arc<dyn ContentLoader>,
        show: Sender<ShowCommand>,
        events: broadcast::Sender<CurrentSlideChanged>,
        lock_policy: LockPolicy,
    ) -> Self {
        Self {
            registry,
            cache,
            loader,
            show,
            events,
            lock_policy,
        }
    }

    pub fn registry(&self) -> &SlideRegistry {
        &self.registry
    }

    /// Fetches, parses and registers a new slide. Known ids are updated.
    #[instrument(skip(self, meta), fields(slide = %meta.id))]
    pub async fn add_slide(&self, meta: SlideMetadata) -> Result<(), SlideError> {
        let id = meta.id.clone();
        let this = self.clone();
        let res = detached(&id, async move { this.add(meta).await }).await;
        if let Err(err) = &res {
            warn!(error = %err, "add failed");
        }
        res
    }

    /// Takes a slide out of the show and frees it. Unknown ids are ignored.
    #[instrument(skip(self), fields(slide = %id))]
    pub async fn remove_slide(&self, id: &SlideId) -> Result<(), SlideError> {
        let this = self.clone();
        let owned = id.clone();
        let res = detached(id, async move { this.remove(&owned).await }).await;
        if let Err(err) = &res {
            warn!(error = %err, "remove failed");
        }
        res
    }

    /// Reloads a slide whose remote timestamp changed. Unknown ids are added.
    #[instrument(skip(self, meta), fields(slide = %meta.id))]
    pub async fn update_slide(&self, meta: SlideMetadata) -> Result<(), SlideError> {
        let id = meta.id.clone();
        let this = self.clone();
        let res = detached(&id, async move { this.update(meta).await }).await;
        if let Err(err) = &res {
            warn!(error = %err, "update failed");
        }
        res
    }

    /// Re-adds every slide with a manifest in the cache. Returns how many
    /// came back.
    pub async fn restore_cached(&self) -> usize {
        self.cache.purge_staging().await;
        let mut restored = 0;
        for meta in self.cache.cached_manifests().await {
            let id = meta.id.clone();
            match self.add(meta).await {
                Ok(()) => restored += 1,
                Err(err) => warn!(slide = %id, error = %err, "failed to restore cached slide"),
            }
        }
        info!(restored, cache = %self.cache.root().display(), "cached slides restored");
        restored
    }

    pub async fn next(&self) -> Result<(), SlideError> {
        self.notify(ShowCommand::Next).await
    }

    pub async fn previous(&self) -> Result<(), SlideError> {
        self.notify(ShowCommand::Previous).await
    }

    pub async fn stop(&self) -> Result<(), SlideError> {
        self.notify(ShowCommand::Stop).await
    }

    pub async fn start(&self) -> Result<(), SlideError> {
        self.notify(ShowCommand::Start).await
    }

    pub async fn status(&self) -> Result<ShowStatus, SlideError> {
        self.request(|reply| ShowCommand::Status { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CurrentSlideChanged> {
        self.events.subscribe()
    }

    async fn add(&self, meta: SlideMetadata) -> Result<(), SlideError> {
        meta.validate()?;
        loop {
            let slide = Slide::pending(meta.clone());
            // Locked before it is published: a reservation is only ever seen
            // unlocked once its add is over.
            let guard = slide.lock().lock_owned().await;
            match self.registry.reserve(Arc::clone(&slide)) {
                Ok(()) => return self.load_new(slide, guard, meta).await,
                Err(existing) => {
                    drop(guard);
                    debug!("slide already known, treating add as update");
                    if self.update_known(existing, &meta).await? == Outcome::Done {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn update(&self, meta: SlideMetadata) -> Result<(), SlideError> {
        meta.validate()?;
        let Some(slide) = self.registry.lookup(&meta.id) else {
            debug!("unknown slide, adding");
            return self.add(meta).await;
        };
        match self.update_known(slide, &meta).await? {
            Outcome::Done => Ok(()),
            Outcome::Vanished => self.add(meta).await,
        }
    }

    async fn load_new(
        &self,
        slide: Arc<Slide>,
        guard: OwnedMutexGuard<()>,
        meta: SlideMetadata,
    ) -> Result<(), SlideError> {
        let content = match self.load(&meta).await {
            Ok(content) => content,
            Err(err) => {
                self.registry.cancel_reservation(&slide);
                return Err(err);
            }
        };
        slide.install(meta.clone(), content);
        self.persist(&meta).await;
        drop(guard);

        let fresh = self
            .request(|reply| ShowCommand::Register { slide, reply })
            .await?;
        info!(timestamp = %meta.timestamp, fresh, "slide added");
        Ok(())
    }

    async fn remove(&self, id: &SlideId) -> Result<(), SlideError> {
        let Some(slide) = self.registry.lookup(id) else {
            debug!("unknown slide, nothing to remove");
            return Ok(());
        };
        if slide.state() == LifecycleState::Removed {
            return Ok(());
        }

        // Also covers a slide whose add is still loading: the show refuses to
        // rotate it once it is registered.
        slide.mark_retiring();
        self.request(|reply| ShowCommand::Retire {
            id: id.clone(),
            reply,
        })
        .await?;
        let guard = self.acquire(&slide, true).await?;
        if slide.state() == LifecycleState::Removed {
            debug!("slide removed concurrently");
            return Ok(());
        }
        let still_known = self
            .registry
            .lookup(id)
            .is_some_and(|known| Arc::ptr_eq(&known, &slide));
        slide.mark_removed();
        if !still_known {
            debug!("add failed while waiting, nothing to remove");
            return Ok(());
        }
        self.registry.cancel_reservation(&slide);
        self.request(|reply| ShowCommand::Unregister {
            id: id.clone(),
            reply,
        })
        .await?;
        if let Some(content) = slide.take_content() {
            self.loader.release(id, content);
        }
        self.cache.evict(id).await;
        drop(guard);
        info!("slide removed");
        Ok(())
    }

    async fn update_known(&self, slide: Arc<Slide>, meta: &SlideMetadata) -> Result<Outcome, SlideError> {
        if slide.timestamp() == meta.timestamp {
            debug!(timestamp = %meta.timestamp, "timestamp unchanged, nothing to do");
            return Ok(Outcome::Done);
        }
        let guard = self.acquire(&slide, false).await?;
        let known = self
            .registry
            .lookup(&meta.id)
            .is_some_and(|current| Arc::ptr_eq(&current, &slide));
        // The add we waited for failed or was abandoned, or a removal won the
        // lock first.
        if !known || matches!(slide.state(), LifecycleState::Pending | LifecycleState::Removed) {
            if self.registry.cancel_reservation(&slide) {
                warn!("dropping abandoned reservation");
            }
            debug!("slide vanished while waiting");
            return Ok(Outcome::Vanished);
        }
        if slide.timestamp() == meta.timestamp {
            debug!(timestamp = %meta.timestamp, "updated concurrently, nothing to do");
            return Ok(Outcome::Done);
        }

        let content = self.load(meta).await?;
        let previous = slide.install(meta.clone(), content);
        self.persist(meta).await;
        drop(guard);

        self.notify(ShowCommand::Refreshed {
            id: meta.id.clone(),
        })
        .await?;
        if let Some(previous) = previous {
            self.loader.release(&meta.id, previous);
        }
        info!(timestamp = %meta.timestamp, "slide updated");
        Ok(Outcome::Done)
    }

    /// Fetches and parses `meta`'s bundle. The new extraction replaces the
    /// cached one only if it parses.
    async fn load(&self, meta: &SlideMetadata) -> Result<LoadedContent, SlideError> {
        let bundle = self
            .cache
            .fetch_and_cache(&meta.id, &meta.url, &meta.timestamp)
            .await?;
        let loader = Arc::clone(&self.loader);
        let id = meta.id.clone();
        let mode = meta.mode.clone();
        let dir = bundle.dir().to_path_buf();
        let parsed = task::spawn_blocking(move || loader.load(&id, &dir, &mode))
            .await
            .map_err(|err| SlideError::parse(&meta.id, format!("loader task failed: {err}")))
            .and_then(|res| res);
        match parsed {
            Ok(content) => {
                bundle.commit().await;
                Ok(content)
            }
            Err(err) => {
                bundle.rollback().await;
                Err(err)
            }
        }
    }

    async fn persist(&self, meta: &SlideMetadata) {
        if let Err(err) = self.cache.write_manifest(meta).await {
            warn!(error = %err, "failed to persist manifest");
        }
    }

    /// Takes the slide lock with bounded exponential backoff. With
    /// `require_hidden` the lock only counts once the slide is off screen.
    async fn acquire(
        &self,
        slide: &Arc<Slide>,
        require_hidden: bool,
    ) -> Result<OwnedMutexGuard<()>, SlideError> {
        let policy = self.lock_policy;
        for attempt in 0..policy.attempts {
            if let Ok(guard) = slide.lock().try_lock_owned() {
                if !require_hidden || !slide.is_visible() {
                    return Ok(guard);
                }
            }
            let failed = attempt + 1;
            if failed >= policy.attempts {
                break;
            }
            if failed >= policy.warn_after {
                warn!(
                    slide = %slide.id(),
                    attempt = failed,
                    attempts = policy.attempts,
                    "LockTimeoutRisk: slide still busy"
                );
            }
            sleep(policy.backoff(attempt)).await;
        }
        Err(SlideError::LockTimeout {
            id: slide.id().clone(),
            attempts: policy.attempts,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ShowCommand,
    ) -> Result<T, SlideError> {
        let (tx, rx) = oneshot::channel();
        self.notify(make(tx)).await?;
        rx.await.map_err(|_| SlideError::ShowClosed)
    }

    async fn notify(&self, cmd: ShowCommand) -> Result<(), SlideError> {
        self.show.send(cmd).await.map_err(|_| SlideError::ShowClosed)
    }
}

/// Runs a mutation on its own task. A caller that stops waiting cannot cut a
/// fetch, a reload or a removal short.
async fn detached<F>(id: &SlideId, op: F) -> Result<(), SlideError>
where
    F: Future<Output = Result<(), SlideError>> + Send + 'static,
{
    match task::spawn(op.in_current_span()).await {
        Ok(res) => res,
        Err(err) => Err(SlideError::Aborted {
            id: id.clone(),
            reason: err.to_string(),
        }),
    }
}
