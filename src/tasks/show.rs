use std::collections::HashMap;
use std::future::pending;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::mpsc::Receiver;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::content::{ContentHandle, HookPoint};
use crate::controller::{Effect, Phase, Readiness, SlideDeck, TransitionController};
use crate::events::{CurrentSlideChanged, ShowCommand, ShowStatus, SlideSummary};
use crate::playlist::{Playlist, PlaylistItem};
use crate::registry::SlideRegistry;
use crate::renderer::{AnimationSignal, Renderer};
use crate::slide::{LifecycleState, SlideId, TransitionKind};

#[derive(Debug, Clone)]
pub struct ShowOptions {
    pub auto_advance: bool,
    pub hook_loop_interval: Duration,
    pub playlist: Option<Vec<PlaylistItem>>,
    pub seed: Option<u64>,
}

impl Default for ShowOptions {
    fn default() -> Self {
        Self {
            auto_advance: true,
            hook_loop_interval: Duration::from_secs(1),
            playlist: None,
            seed: None,
        }
    }
}

/// Drives the show until cancelled or every command sender is gone.
///
/// This task is the only writer of the playlist, the transition controller
/// and the screen. Everything else reaches it through `commands`.
pub async fn run<R: Renderer + 'static>(
    options: ShowOptions,
    registry: SlideRegistry,
    renderer: R,
    mut commands: Receiver<ShowCommand>,
    events: broadcast::Sender<CurrentSlideChanged>,
    cancel: CancellationToken,
) -> Result<()> {
    let playlist = match options.playlist {
        Some(items) => Playlist::from_items(items, options.seed).context("invalid playlist")?,
        None => Playlist::new(options.seed),
    };
    let mut show = Show {
        registry,
        playlist,
        controller: TransitionController::new(options.auto_advance),
        renderer,
        claims: HashMap::new(),
        attached: HashMap::new(),
        deadline: None,
        animations: JoinSet::new(),
        events,
    };
    let mut loop_tick = interval(options.hook_loop_interval);
    loop_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(auto_advance = options.auto_advance, "show loop started");

    loop {
        let deadline = show.deadline;
        select! {
            _ = cancel.cancelled() => {
                info!("cancel received; stopping show loop");
                break;
            }

            cmd = commands.recv() => match cmd {
                Some(cmd) => show.handle(cmd),
                None => {
                    debug!("all command senders dropped");
                    break;
                }
            },

            generation = async move {
                match deadline {
                    Some((generation, at)) => {
                        sleep_until(at).await;
                        generation
                    }
                    None => pending().await,
                }
            } => {
                show.deadline = None;
                trace!(generation, "duration timer fired");
                show.drive(|ctl, pl, deck| ctl.timer_fired(generation, pl, deck));
            }

            Some(done) = show.animations.join_next() => match done {
                Ok(token) => show.drive(|ctl, pl, deck| ctl.animation_finished(token, pl, deck)),
                Err(err) => warn!(error = %err, "animation task failed"),
            },

            _ = loop_tick.tick() => show.loop_hook(),
        }
    }

    show.shutdown();
    Ok(())
}

struct Show<R> {
    registry: SlideRegistry,
    playlist: Playlist,
    controller: TransitionController,
    renderer: R,
    /// Per-slide locks held by the controller during animations.
    claims: HashMap<SlideId, OwnedMutexGuard<()>>,
    /// Content currently attached to the renderer, by slide.
    attached: HashMap<SlideId, ContentHandle>,
    deadline: Option<(u64, Instant)>,
    animations: JoinSet<u64>,
    events: broadcast::Sender<CurrentSlideChanged>,
}

/// Registry-backed [`SlideDeck`] that claims slide locks without waiting.
struct Deck<'a> {
    registry: &'a SlideRegistry,
    claims: &'a mut HashMap<SlideId, OwnedMutexGuard<()>>,
}

impl SlideDeck for Deck<'_> {
    fn readiness(&self, id: &SlideId) -> Readiness {
        match self.registry.get(id) {
            Some(slide) => match slide.state() {
                LifecycleState::Ready | LifecycleState::OnScreen if slide.content().is_some() => {
                    Readiness::Ready
                }
                LifecycleState::Retiring | LifecycleState::Removed => Readiness::Unavailable,
                _ => Readiness::Loading,
            },
            None if self.registry.is_loading(id) => Readiness::Loading,
            None => Readiness::Unavailable,
        }
    }

    fn timing(&self, id: &SlideId) -> Option<(Duration, TransitionKind)> {
        self.registry
            .lookup(id)
            .map(|slide| (slide.duration(), slide.transition()))
    }

    fn claim(&mut self, id: &SlideId) -> bool {
        if self.claims.contains_key(id) {
            return true;
        }
        let Some(slide) = self.registry.lookup(id) else {
            return false;
        };
        match slide.lock().try_lock_owned() {
            Ok(guard) => {
                trace!(slide = %id, "claimed");
                self.claims.insert(id.clone(), guard);
                true
            }
            Err(_) => false,
        }
    }

    fn release(&mut self, id: &SlideId) {
        if self.claims.remove(id).is_some() {
            trace!(slide = %id, "released");
        }
    }
}

impl<R: Renderer> Show<R> {
    fn drive<F>(&mut self, f: F)
    where
        F: FnOnce(&mut TransitionController, &mut Playlist, &mut Deck<'_>) -> Vec<Effect>,
    {
        let mut deck = Deck {
            registry: &self.registry,
            claims: &mut self.claims,
        };
        let effects = f(&mut self.controller, &mut self.playlist, &mut deck);
        self.apply(effects);
    }

    fn handle(&mut self, cmd: ShowCommand) {
        match cmd {
            ShowCommand::Register { slide, reply } => {
                let id = slide.id().clone();
                if matches!(slide.state(), LifecycleState::Retiring | LifecycleState::Removed) {
                    debug!(slide = %id, "removed before registration, dropping");
                    let _ = reply.send(false);
                    return;
                }
                let fresh = self.registry.add(slide);
                if !self.playlist.is_explicit() {
                    self.playlist.ensure_single(&id);
                }
                debug!(slide = %id, fresh, "slide registered with show");
                self.drive(|ctl, pl, deck| ctl.slides_changed(pl, deck));
                let _ = reply.send(fresh);
            }
            ShowCommand::Retire { id, reply } => {
                if let Some(slide) = self.registry.get(&id) {
                    slide.mark_retiring();
                    self.drive(|ctl, pl, deck| ctl.retire(&id, pl, deck));
                }
                let _ = reply.send(());
            }
            ShowCommand::Unregister { id, reply } => {
                self.registry.remove(&id);
                // An explicit rotation keeps its slots so a later add fills them again.
                if !self.playlist.is_explicit() {
                    self.playlist.remove_id(&id);
                }
                self.drive(|ctl, pl, deck| ctl.forget(&id, pl, deck));
                let _ = reply.send(());
            }
            ShowCommand::Refreshed { id } => {
                self.drive(|ctl, pl, deck| ctl.refreshed(&id, pl, deck));
            }
            ShowCommand::Next => self.drive(|ctl, pl, deck| ctl.next(pl, deck)),
            ShowCommand::Previous => self.drive(|ctl, pl, deck| ctl.previous(pl, deck)),
            ShowCommand::Stop => self.drive(|ctl, _, deck| ctl.stop(deck)),
            ShowCommand::Start => self.drive(|ctl, pl, deck| ctl.start(pl, deck)),
            ShowCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            trace!(?effect, "apply");
            match effect {
                Effect::Hook(id, point) => {
                    if let Some(content) = self.registry.lookup(&id).and_then(|s| s.content()) {
                        content.run_hook(&id, point);
                    }
                }
                Effect::Entered(id) => {
                    if let Some(slide) = self.registry.lookup(&id) {
                        slide.mark_on_screen();
                    }
                }
                Effect::Attach(id) => {
                    match self.registry.lookup(&id).and_then(|s| s.content()) {
                        Some(content) => {
                            self.renderer.attach(&id, &content.handle);
                            self.attached.insert(id, content.handle);
                        }
                        None => warn!(slide = %id, "no content to attach"),
                    }
                }
                Effect::PlayIntro { id, transition, token } => {
                    let signal = self
                        .attached
                        .get(&id)
                        .map(|handle| self.renderer.play_intro(&id, handle, transition));
                    self.await_animation(token, signal);
                }
                Effect::PlayOutro { id, transition, token } => {
                    let signal = self
                        .attached
                        .get(&id)
                        .map(|handle| self.renderer.play_outro(&id, handle, transition));
                    self.await_animation(token, signal);
                }
                Effect::Detach(id) => {
                    if let Some(handle) = self.attached.remove(&id) {
                        self.renderer.detach(&id, &handle);
                    }
                }
                Effect::Left(id) => {
                    if let Some(slide) = self.registry.lookup(&id) {
                        slide.mark_off_screen();
                    }
                }
                Effect::ArmTimer { generation, after } => {
                    trace!(generation, ?after, "arming duration timer");
                    self.deadline = Some((generation, Instant::now() + after));
                }
                Effect::CancelTimer => self.deadline = None,
                Effect::CurrentSlideChanged(id) => {
                    info!(slide = %id, "current slide changed");
                    let _ = self.events.send(CurrentSlideChanged(id));
                }
                Effect::Refresh(id) => self.refresh(id),
            }
        }
    }

    fn await_animation(&mut self, token: u64, signal: Option<AnimationSignal>) {
        self.animations.spawn(async move {
            if let Some(signal) = signal {
                // A dropped sender counts as finished.
                let _ = signal.await;
            }
            token
        });
    }

    fn refresh(&mut self, id: SlideId) {
        let Some(content) = self.registry.get(&id).and_then(|s| s.content()) else {
            return;
        };
        if let Some(old) = self.attached.get(&id) {
            if old.same_as(&content.handle) {
                return;
            }
            self.renderer.detach(&id, old);
        }
        info!(slide = %id, "refreshing on-screen slide");
        self.renderer.attach(&id, &content.handle);
        self.attached.insert(id, content.handle);
    }

    fn loop_hook(&self) {
        if self.controller.phase() != Phase::Steady {
            return;
        }
        let Some(id) = self.controller.current() else {
            return;
        };
        if let Some(content) = self.registry.get(id).and_then(|s| s.content()) {
            content.run_hook(id, HookPoint::Loop);
        }
    }

    fn status(&self) -> ShowStatus {
        ShowStatus {
            phase: self.controller.phase(),
            current: self.controller.current().cloned(),
            queued: self.controller.queued().cloned(),
            selected: self.playlist.selected().cloned(),
            slides: self
                .registry
                .list()
                .iter()
                .map(|slide| SlideSummary::from(slide.as_ref()))
                .collect(),
            playlist: self.playlist.items(),
        }
    }

    fn shutdown(&mut self) {
        for (id, handle) in self.attached.drain() {
            self.renderer.detach(&id, &handle);
            if let Some(slide) = self.registry.lookup(&id) {
                slide.mark_off_screen();
            }
        }
        self.claims.clear();
        self.animations.abort_all();
        debug!("show loop shut down");
    }
}
