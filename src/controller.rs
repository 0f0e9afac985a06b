//! Transition state machine.
//!
//! The controller never touches the renderer, the clock or the registry
//! directly. Every input returns the [`Effect`]s the show loop must execute,
//! which keeps the sequencing rules testable without a runtime.

use std::time::Duration;

use tracing::{debug, trace};

use crate::content::HookPoint;
use crate::playlist::{Direction, Playlist};
use crate::slide::{SlideId, TransitionKind};

/// Delay before a stop that could not claim the on-screen slide is retried.
const STOP_RETRY: Duration = Duration::from_millis(100);
/// Fallback display time for a slide whose timing is no longer known.
const FALLBACK_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Fetched, parsed and registered.
    Ready,
    /// An add is in flight for this id.
    Loading,
    /// Unknown, retiring or removed.
    Unavailable,
}

/// The controller's view of the slide collection.
pub trait SlideDeck {
    fn readiness(&self, id: &SlideId) -> Readiness;

    fn timing(&self, id: &SlideId) -> Option<(Duration, TransitionKind)>;

    /// Takes the slide's mutation lock without waiting. Returns false when a
    /// load, update or removal currently holds it.
    fn claim(&mut self, id: &SlideId) -> bool;

    fn release(&mut self, id: &SlideId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    ShowingIntro,
    Steady,
    ShowingOutro,
}

/// Work the show loop performs on the controller's behalf, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Hook(SlideId, HookPoint),
    /// The slide became the on-screen slide.
    Entered(SlideId),
    Attach(SlideId),
    PlayIntro {
        id: SlideId,
        transition: TransitionKind,
        token: u64,
    },
    PlayOutro {
        id: SlideId,
        transition: TransitionKind,
        token: u64,
    },
    Detach(SlideId),
    /// The slide is no longer on screen.
    Left(SlideId),
    /// Replace any armed timer with one firing after `after`.
    ArmTimer { generation: u64, after: Duration },
    CancelTimer,
    CurrentSlideChanged(SlideId),
    /// Swap the on-screen content for freshly loaded content in place.
    Refresh(SlideId),
}

#[derive(Debug)]
pub struct TransitionController {
    phase: Phase,
    current: Option<SlideId>,
    incoming: Option<SlideId>,
    queued: Option<SlideId>,
    generation: u64,
    armed: Option<u64>,
    token: u64,
    awaiting: Option<u64>,
    auto_advance: bool,
    stop_requested: bool,
    halted: bool,
}

impl TransitionController {
    pub fn new(auto_advance: bool) -> Self {
        Self {
            phase: Phase::Idle,
            current: None,
            incoming: None,
            queued: None,
            generation: 0,
            armed: None,
            token: 0,
            awaiting: None,
            auto_advance,
            stop_requested: false,
            halted: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The slide attached to the screen, if any.
    pub fn current(&self) -> Option<&SlideId> {
        self.current.as_ref()
    }

    pub fn queued(&self) -> Option<&SlideId> {
        self.queued.as_ref()
    }

    pub fn armed_generation(&self) -> Option<u64> {
        self.armed
    }

    pub fn start(&mut self, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        self.halted = false;
        self.stop_requested = false;
        match self.phase {
            Phase::Idle => self.start_from_idle(playlist, deck),
            _ => Vec::new(),
        }
    }

    pub fn stop(&mut self, deck: &mut impl SlideDeck) -> Vec<Effect> {
        self.halted = true;
        match self.phase {
            Phase::Idle => Vec::new(),
            Phase::ShowingIntro | Phase::ShowingOutro => {
                debug!(phase = ?self.phase, "stop deferred until animation completes");
                self.stop_requested = true;
                Vec::new()
            }
            Phase::Steady => self.begin_stop(deck),
        }
    }

    pub fn next(&mut self, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        self.manual_advance(Direction::Forward, playlist, deck)
    }

    pub fn previous(&mut self, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        self.manual_advance(Direction::Reverse, playlist, deck)
    }

    pub fn timer_fired(
        &mut self,
        generation: u64,
        playlist: &mut Playlist,
        deck: &mut impl SlideDeck,
    ) -> Vec<Effect> {
        if self.phase != Phase::Steady || self.armed != Some(generation) {
            trace!(generation, armed = ?self.armed, "ignoring stale timer");
            return Vec::new();
        }
        self.armed = None;
        if self.stop_requested {
            return self.begin_stop(deck);
        }
        self.begin_advance(Direction::Forward, playlist, deck)
    }

    pub fn animation_finished(
        &mut self,
        token: u64,
        playlist: &mut Playlist,
        deck: &mut impl SlideDeck,
    ) -> Vec<Effect> {
        if self.awaiting != Some(token) {
            trace!(token, awaiting = ?self.awaiting, "ignoring stale animation completion");
            return Vec::new();
        }
        self.awaiting = None;
        match self.phase {
            Phase::ShowingIntro => self.finish_intro(playlist, deck),
            Phase::ShowingOutro => self.finish_outro(playlist, deck),
            Phase::Idle | Phase::Steady => Vec::new(),
        }
    }

    /// The set of playable slides changed.
    pub fn slides_changed(&mut self, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        match self.phase {
            Phase::Idle if !self.halted => self.start_from_idle(playlist, deck),
            Phase::Steady if self.armed.is_none() && !self.stop_requested => {
                match self.current.clone() {
                    Some(current) => self.arm_if_rotating(&current, playlist, deck),
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    /// `id` is being removed; the deck already reports it unavailable.
    pub fn retire(&mut self, id: &SlideId, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        if self.queued.as_ref() == Some(id) {
            self.queued = None;
        }
        if self.current.as_ref() != Some(id) {
            return Vec::new();
        }
        match self.phase {
            Phase::Steady => {
                debug!(slide = %id, "on-screen slide retired, advancing");
                self.armed = None;
                self.begin_advance(Direction::Forward, playlist, deck)
            }
            // Intro completion re-checks readiness; an outro is already leaving.
            _ => Vec::new(),
        }
    }

    /// `id` left the registry and the playlist.
    pub fn forget(&mut self, id: &SlideId, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        if self.queued.as_ref() == Some(id) {
            self.queued = None;
        }
        if self.phase == Phase::Steady && self.current.as_ref() == Some(id) {
            self.phase = Phase::Idle;
            self.current = None;
            self.armed = None;
            let mut effects = vec![
                Effect::CancelTimer,
                Effect::Detach(id.clone()),
                Effect::Left(id.clone()),
            ];
            if !self.halted {
                effects.extend(self.start_from_idle(playlist, deck));
            }
            return effects;
        }
        Vec::new()
    }

    /// New content was installed for `id`.
    pub fn refreshed(&mut self, id: &SlideId, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        if self.phase == Phase::Steady && self.current.as_ref() == Some(id) {
            return vec![Effect::Refresh(id.clone())];
        }
        self.slides_changed(playlist, deck)
    }

    fn manual_advance(
        &mut self,
        direction: Direction,
        playlist: &mut Playlist,
        deck: &mut impl SlideDeck,
    ) -> Vec<Effect> {
        match self.phase {
            Phase::Steady => {
                self.armed = None;
                self.queued = None;
                self.begin_advance(direction, playlist, deck)
            }
            phase => {
                debug!(?phase, ?direction, "manual advance ignored");
                Vec::new()
            }
        }
    }

    fn start_from_idle(&mut self, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        for _ in 0..playlist.len() {
            if let Some(id) = playlist.current() {
                if deck.readiness(&id) == Readiness::Ready && deck.claim(&id) {
                    return self.begin_intro(id, deck);
                }
            }
            playlist.advance(Direction::Forward);
        }
        trace!("nothing playable yet");
        Vec::new()
    }

    fn begin_intro(&mut self, id: SlideId, deck: &mut impl SlideDeck) -> Vec<Effect> {
        let transition = deck.timing(&id).map(|(_, kind)| kind).unwrap_or_default();
        let token = self.next_token();
        debug!(slide = %id, %transition, token, "intro");
        self.phase = Phase::ShowingIntro;
        self.current = Some(id.clone());
        vec![
            Effect::Hook(id.clone(), HookPoint::BeforeShow),
            Effect::Entered(id.clone()),
            Effect::Attach(id.clone()),
            Effect::PlayIntro {
                id,
                transition,
                token,
            },
        ]
    }

    fn finish_intro(&mut self, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        let Some(current) = self.current.clone() else {
            self.phase = Phase::Idle;
            return Vec::new();
        };
        self.phase = Phase::Steady;
        deck.release(&current);
        let mut effects = vec![
            Effect::Hook(current.clone(), HookPoint::AfterShow),
            Effect::CurrentSlideChanged(current.clone()),
        ];
        if self.stop_requested {
            effects.extend(self.begin_stop(deck));
        } else if deck.readiness(&current) == Readiness::Unavailable {
            effects.extend(self.begin_advance(Direction::Forward, playlist, deck));
        } else {
            effects.extend(self.arm_if_rotating(&current, playlist, deck));
        }
        effects
    }

    fn finish_outro(&mut self, playlist: &mut Playlist, deck: &mut impl SlideDeck) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(outgoing) = self.current.take() {
            effects.push(Effect::Detach(outgoing.clone()));
            effects.push(Effect::Hook(outgoing.clone(), HookPoint::AfterHide));
            effects.push(Effect::Left(outgoing.clone()));
            deck.release(&outgoing);
        }
        let incoming = self.incoming.take();
        self.phase = Phase::Idle;
        if self.stop_requested {
            self.stop_requested = false;
            if let Some(incoming) = incoming {
                deck.release(&incoming);
            }
            debug!("show stopped");
            return effects;
        }
        match incoming {
            Some(incoming) if deck.readiness(&incoming) == Readiness::Ready => {
                effects.extend(self.begin_intro(incoming, deck));
            }
            Some(incoming) => {
                debug!(slide = %incoming, "incoming slide vanished during outro");
                deck.release(&incoming);
                if !self.halted {
                    effects.extend(self.start_from_idle(playlist, deck));
                }
            }
            None => debug!("no slide left to show"),
        }
        effects
    }

    /// Resolve the slide after the current one and start leaving, or keep the
    /// current slide and re-arm when nothing else can be shown yet.
    fn begin_advance(
        &mut self,
        direction: Direction,
        playlist: &mut Playlist,
        deck: &mut impl SlideDeck,
    ) -> Vec<Effect> {
        let Some(current) = self.current.clone() else {
            return Vec::new();
        };
        if !deck.claim(&current) {
            debug!(slide = %current, "on-screen slide busy, extending");
            return self.rearm(&current, deck);
        }
        let retiring = deck.readiness(&current) == Readiness::Unavailable;

        for _ in 0..playlist.len().max(1) {
            let candidate = match self.queued.take() {
                Some(queued) => Some(queued),
                None => {
                    playlist.advance(direction);
                    playlist.current()
                }
            };
            let Some(candidate) = candidate else { continue };
            if candidate == current {
                continue;
            }
            match deck.readiness(&candidate) {
                Readiness::Unavailable => continue,
                Readiness::Loading if retiring => continue,
                Readiness::Loading => {
                    debug!(slide = %candidate, "next slide still loading, extending current");
                    self.queued = Some(candidate);
                    deck.release(&current);
                    return self.rearm(&current, deck);
                }
                Readiness::Ready => {
                    if deck.claim(&candidate) {
                        return self.begin_outro(current, Some(candidate), deck);
                    }
                    if retiring {
                        continue;
                    }
                    debug!(slide = %candidate, "next slide busy, extending current");
                    self.queued = Some(candidate);
                    deck.release(&current);
                    return self.rearm(&current, deck);
                }
            }
        }

        if retiring {
            debug!(slide = %current, "nothing left to show, stopping");
            return self.begin_outro(current, None, deck);
        }
        deck.release(&current);
        self.arm_if_rotating(&current, playlist, deck)
    }

    fn begin_outro(
        &mut self,
        current: SlideId,
        incoming: Option<SlideId>,
        deck: &mut impl SlideDeck,
    ) -> Vec<Effect> {
        let transition = deck
            .timing(&current)
            .map(|(_, kind)| kind)
            .unwrap_or_default();
        let token = self.next_token();
        debug!(slide = %current, incoming = ?incoming, %transition, token, "outro");
        self.phase = Phase::ShowingOutro;
        self.armed = None;
        self.incoming = incoming;
        vec![
            Effect::CancelTimer,
            Effect::Hook(current.clone(), HookPoint::BeforeHide),
            Effect::PlayOutro {
                id: current,
                transition,
                token,
            },
        ]
    }

    fn begin_stop(&mut self, deck: &mut impl SlideDeck) -> Vec<Effect> {
        let Some(current) = self.current.clone() else {
            self.phase = Phase::Idle;
            return Vec::new();
        };
        if !deck.claim(&current) {
            self.stop_requested = true;
            return self.arm(STOP_RETRY);
        }
        self.stop_requested = true;
        self.begin_outro(current, None, deck)
    }

    fn arm_if_rotating(&mut self, current: &SlideId, playlist: &Playlist, deck: &impl SlideDeck) -> Vec<Effect> {
        if self.auto_advance && playlist.has_alternatives() {
            self.rearm(current, deck)
        } else {
            trace!(slide = %current, "holding slide without timer");
            self.armed = None;
            Vec::new()
        }
    }

    fn rearm(&mut self, current: &SlideId, deck: &impl SlideDeck) -> Vec<Effect> {
        let after = deck
            .timing(current)
            .map(|(duration, _)| duration)
            .unwrap_or(FALLBACK_DURATION);
        self.arm(after)
    }

    fn arm(&mut self, after: Duration) -> Vec<Effect> {
        self.generation += 1;
        self.armed = Some(self.generation);
        vec![Effect::ArmTimer {
            generation: self.generation,
            after,
        }]
    }

    fn next_token(&mut self) -> u64 {
        self.token += 1;
        self.awaiting = Some(self.token);
        self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct TestDeck {
        slides: HashMap<SlideId, (Readiness, Duration)>,
        claimed: HashSet<SlideId>,
        busy: HashSet<SlideId>,
    }

    impl TestDeck {
        fn with(&mut self, id: &str, secs: u64) -> SlideId {
            let id = SlideId::new(id);
            self.slides
                .insert(id.clone(), (Readiness::Ready, Duration::from_secs(secs)));
            id
        }

        fn set(&mut self, id: &SlideId, readiness: Readiness) {
            if let Some(entry) = self.slides.get_mut(id) {
                entry.0 = readiness;
            }
        }
    }

    impl SlideDeck for TestDeck {
        fn readiness(&self, id: &SlideId) -> Readiness {
            self.slides
                .get(id)
                .map(|(r, _)| *r)
                .unwrap_or(Readiness::Unavailable)
        }

        fn timing(&self, id: &SlideId) -> Option<(Duration, TransitionKind)> {
            self.slides.get(id).map(|(_, d)| (*d, TransitionKind::Fade))
        }

        fn claim(&mut self, id: &SlideId) -> bool {
            !self.busy.contains(id) && self.claimed.insert(id.clone())
        }

        fn release(&mut self, id: &SlideId) {
            self.claimed.remove(id);
        }
    }

    fn token_of(effects: &[Effect]) -> u64 {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::PlayIntro { token, .. } | Effect::PlayOutro { token, .. } => Some(*token),
                _ => None,
            })
            .expect("an animation effect")
    }

    fn timer_of(effects: &[Effect]) -> Option<(u64, Duration)> {
        effects.iter().find_map(|e| match e {
            Effect::ArmTimer { generation, after } => Some((*generation, *after)),
            _ => None,
        })
    }

    fn changed(effects: &[Effect]) -> Vec<SlideId> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::CurrentSlideChanged(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn playlist_of(ids: &[&SlideId]) -> Playlist {
        let mut pl = Playlist::new(Some(7));
        for id in ids {
            pl.ensure_single(id);
        }
        pl
    }

    /// Drives the controller from idle to steady on the first slide.
    fn run_to_steady(
        ctl: &mut TransitionController,
        pl: &mut Playlist,
        deck: &mut TestDeck,
    ) -> Vec<Effect> {
        let fx = ctl.start(pl, deck);
        ctl.animation_finished(token_of(&fx), pl, deck)
    }

    #[test]
    fn single_slide_stays_steady_without_timer() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let mut pl = playlist_of(&[&one]);
        let mut ctl = TransitionController::new(true);

        let fx = ctl.start(&mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::ShowingIntro);
        assert_eq!(fx[0], Effect::Hook(one.clone(), HookPoint::BeforeShow));
        assert!(deck.claimed.contains(&one));

        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::Steady);
        assert_eq!(changed(&fx), vec![one.clone()]);
        assert!(timer_of(&fx).is_none());
        assert!(ctl.armed_generation().is_none());
        assert!(deck.claimed.is_empty());
    }

    #[test]
    fn second_slide_arms_timer() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let mut pl = playlist_of(&[&one]);
        let mut ctl = TransitionController::new(true);
        run_to_steady(&mut ctl, &mut pl, &mut deck);

        let two = deck.with("2", 5);
        pl.ensure_single(&two);
        let fx = ctl.slides_changed(&mut pl, &mut deck);
        assert_eq!(timer_of(&fx).map(|(_, d)| d), Some(Duration::from_secs(3)));
    }

    #[test]
    fn timer_advances_to_next_slide_once() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let two = deck.with("2", 4);
        let mut pl = playlist_of(&[&one, &two]);
        let mut ctl = TransitionController::new(true);

        let fx = run_to_steady(&mut ctl, &mut pl, &mut deck);
        let (generation, after) = timer_of(&fx).unwrap();
        assert_eq!(after, Duration::from_secs(3));

        let mut all = Vec::new();
        let fx = ctl.timer_fired(generation, &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::ShowingOutro);
        assert!(fx.contains(&Effect::Hook(one.clone(), HookPoint::BeforeHide)));
        all.extend(fx.clone());

        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert!(fx.contains(&Effect::Detach(one.clone())));
        assert!(fx.contains(&Effect::Left(one.clone())));
        assert_eq!(ctl.phase(), Phase::ShowingIntro);
        all.extend(fx.clone());

        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        all.extend(fx);
        assert_eq!(ctl.phase(), Phase::Steady);
        assert_eq!(pl.current(), Some(two.clone()));
        assert_eq!(changed(&all), vec![two]);
        assert!(deck.claimed.is_empty());
    }

    #[test]
    fn stale_timer_and_animation_are_ignored() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let two = deck.with("2", 3);
        let mut pl = playlist_of(&[&one, &two]);
        let mut ctl = TransitionController::new(true);

        let fx = ctl.start(&mut pl, &mut deck);
        let intro = token_of(&fx);
        let fx = ctl.animation_finished(intro, &mut pl, &mut deck);
        let (generation, _) = timer_of(&fx).unwrap();

        assert!(ctl.timer_fired(generation + 1, &mut pl, &mut deck).is_empty());
        assert!(ctl.animation_finished(intro, &mut pl, &mut deck).is_empty());

        // A manual next invalidates the armed generation.
        let fx = ctl.next(&mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::ShowingOutro);
        assert!(ctl.timer_fired(generation, &mut pl, &mut deck).is_empty());
        assert!(!fx.is_empty());
    }

    #[test]
    fn loading_slide_extends_current_and_stays_queued() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let two = deck.with("2", 3);
        deck.set(&two, Readiness::Loading);
        let mut pl = playlist_of(&[&one, &two]);
        let mut ctl = TransitionController::new(true);

        let fx = run_to_steady(&mut ctl, &mut pl, &mut deck);
        let (generation, _) = timer_of(&fx).unwrap();

        let fx = ctl.timer_fired(generation, &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::Steady);
        assert_eq!(ctl.queued(), Some(&two));
        let (generation, after) = timer_of(&fx).unwrap();
        assert_eq!(after, Duration::from_secs(3));
        assert!(deck.claimed.is_empty());

        deck.set(&two, Readiness::Ready);
        let fx = ctl.timer_fired(generation, &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::ShowingOutro);
        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert_eq!(ctl.current(), Some(&two));
        assert!(fx.contains(&Effect::Attach(two)));
    }

    #[test]
    fn busy_current_slide_is_extended() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 2);
        let two = deck.with("2", 2);
        let mut pl = playlist_of(&[&one, &two]);
        let mut ctl = TransitionController::new(true);
        let fx = run_to_steady(&mut ctl, &mut pl, &mut deck);
        let (generation, _) = timer_of(&fx).unwrap();

        deck.busy.insert(one.clone());
        let fx = ctl.timer_fired(generation, &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::Steady);
        assert!(timer_of(&fx).is_some());
        assert_eq!(pl.current(), Some(one));
    }

    #[test]
    fn retiring_current_advances_to_another_slide() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let two = deck.with("2", 3);
        let mut pl = playlist_of(&[&one, &two]);
        let mut ctl = TransitionController::new(true);
        run_to_steady(&mut ctl, &mut pl, &mut deck);

        deck.set(&one, Readiness::Unavailable);
        let fx = ctl.retire(&one, &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::ShowingOutro);
        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert!(fx.contains(&Effect::Left(one.clone())));
        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert_eq!(changed(&fx), vec![two]);
        assert!(!deck.claimed.contains(&one));
    }

    #[test]
    fn retiring_last_slide_stops_the_show() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let mut pl = playlist_of(&[&one]);
        let mut ctl = TransitionController::new(true);
        run_to_steady(&mut ctl, &mut pl, &mut deck);

        deck.set(&one, Readiness::Unavailable);
        let fx = ctl.retire(&one, &mut pl, &mut deck);
        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::Idle);
        assert!(ctl.current().is_none());
        assert!(fx.contains(&Effect::Detach(one)));
        assert!(deck.claimed.is_empty());
    }

    #[test]
    fn slide_retired_during_intro_leaves_after_it() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let two = deck.with("2", 3);
        let mut pl = playlist_of(&[&one, &two]);
        let mut ctl = TransitionController::new(true);

        let fx = ctl.start(&mut pl, &mut deck);
        deck.set(&one, Readiness::Unavailable);
        assert!(ctl.retire(&one, &mut pl, &mut deck).is_empty());

        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::ShowingOutro);
        assert!(fx.iter().any(|e| matches!(e, Effect::PlayOutro { id, .. } if *id == one)));
    }

    #[test]
    fn stop_during_intro_is_applied_on_completion() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let mut pl = playlist_of(&[&one]);
        let mut ctl = TransitionController::new(true);

        let fx = ctl.start(&mut pl, &mut deck);
        assert!(ctl.stop(&mut deck).is_empty());
        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::ShowingOutro);
        ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::Idle);

        // Stopped shows do not restart on their own.
        assert!(ctl.slides_changed(&mut pl, &mut deck).is_empty());
        assert!(!ctl.start(&mut pl, &mut deck).is_empty());
    }

    #[test]
    fn previous_walks_backwards() {
        let mut deck = TestDeck::default();
        let a = deck.with("a", 3);
        let b = deck.with("b", 3);
        let c = deck.with("c", 3);
        let mut pl = playlist_of(&[&a, &b, &c]);
        let mut ctl = TransitionController::new(true);
        run_to_steady(&mut ctl, &mut pl, &mut deck);

        let fx = ctl.previous(&mut pl, &mut deck);
        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        let fx = ctl.animation_finished(token_of(&fx), &mut pl, &mut deck);
        assert_eq!(changed(&fx), vec![c]);
    }

    #[test]
    fn manual_mode_never_arms_timers() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let two = deck.with("2", 3);
        let mut pl = playlist_of(&[&one, &two]);
        let mut ctl = TransitionController::new(false);
        let fx = run_to_steady(&mut ctl, &mut pl, &mut deck);
        assert!(timer_of(&fx).is_none());

        let fx = ctl.next(&mut pl, &mut deck);
        assert_eq!(ctl.phase(), Phase::ShowingOutro);
        assert!(timer_of(&fx).is_none());
    }

    #[test]
    fn refresh_only_targets_on_screen_slide() {
        let mut deck = TestDeck::default();
        let one = deck.with("1", 3);
        let two = deck.with("2", 3);
        let mut pl = playlist_of(&[&one, &two]);
        let mut ctl = TransitionController::new(true);
        run_to_steady(&mut ctl, &mut pl, &mut deck);

        assert_eq!(
            ctl.refreshed(&one, &mut pl, &mut deck),
            vec![Effect::Refresh(one.clone())]
        );
        assert!(ctl.refreshed(&two, &mut pl, &mut deck).is_empty());
    }
}
