use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::controller::Phase;
use crate::playlist::PlaylistItem;
use crate::slide::{LifecycleState, Slide, SlideId, SlideVersion};

/// Published once per completed advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentSlideChanged(pub SlideId);

/// Requests marshalled to the show loop.
#[derive(Debug)]
pub enum ShowCommand {
    /// A freshly loaded slide joins the rotation. The reply tells whether it
    /// was new to the registry.
    Register {
        slide: Arc<Slide>,
        reply: oneshot::Sender<bool>,
    },
    /// Take `id` out of rotation, moving off screen first if needed.
    Retire { id: SlideId, reply: oneshot::Sender<()> },
    /// Drop `id` from registry and playlist. Caller holds the slide lock.
    Unregister { id: SlideId, reply: oneshot::Sender<()> },
    /// New content was installed for `id`.
    Refreshed { id: SlideId },
    Next,
    Previous,
    Stop,
    Start,
    Status { reply: oneshot::Sender<ShowStatus> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlideSummary {
    pub id: SlideId,
    pub timestamp: SlideVersion,
    pub state: LifecycleState,
    pub duration: f64,
}

impl From<&Slide> for SlideSummary {
    fn from(slide: &Slide) -> Self {
        let meta = slide.metadata();
        Self {
            id: meta.id,
            timestamp: meta.timestamp,
            state: slide.state(),
            duration: meta.duration,
        }
    }
}

/// Snapshot of the show for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShowStatus {
    pub phase: Phase,
    pub current: Option<SlideId>,
    pub queued: Option<SlideId>,
    /// The playlist head as last resolved.
    pub selected: Option<SlideId>,
    pub slides: Vec<SlideSummary>,
    pub playlist: Vec<PlaylistItem>,
}
