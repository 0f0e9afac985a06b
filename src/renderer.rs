use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::content::ContentHandle;
use crate::slide::{SlideId, TransitionKind};

/// Resolves when an animation finished. A dropped sender counts as finished.
pub type AnimationSignal = oneshot::Receiver<()>;

/// Drawing surface the show loop drives.
///
/// Implementations must not block: animations run elsewhere and report
/// completion through the returned [`AnimationSignal`].
pub trait Renderer: Send {
    fn attach(&mut self, id: &SlideId, content: &ContentHandle);

    fn detach(&mut self, id: &SlideId, content: &ContentHandle);

    fn play_intro(&mut self, id: &SlideId, content: &ContentHandle, kind: TransitionKind) -> AnimationSignal;

    fn play_outro(&mut self, id: &SlideId, content: &ContentHandle, kind: TransitionKind) -> AnimationSignal;
}

/// Renderer without a display: logs each call and completes animations
/// after a fixed delay.
#[derive(Debug, Clone)]
pub struct HeadlessRenderer {
    transition: Duration,
}

impl HeadlessRenderer {
    pub fn new(transition: Duration) -> Self {
        Self { transition }
    }

    fn animate(&self, kind: TransitionKind) -> AnimationSignal {
        let (tx, rx) = oneshot::channel();
        if !kind.is_animated() || self.transition.is_zero() {
            let _ = tx.send(());
            return rx;
        }
        let delay = self.transition;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        });
        rx
    }
}

impl Renderer for HeadlessRenderer {
    fn attach(&mut self, id: &SlideId, _content: &ContentHandle) {
        info!(slide = %id, "attach");
    }

    fn detach(&mut self, id: &SlideId, _content: &ContentHandle) {
        info!(slide = %id, "detach");
    }

    fn play_intro(&mut self, id: &SlideId, _content: &ContentHandle, kind: TransitionKind) -> AnimationSignal {
        debug!(slide = %id, %kind, "intro");
        self.animate(kind)
    }

    fn play_outro(&mut self, id: &SlideId, _content: &ContentHandle, kind: TransitionKind) -> AnimationSignal {
        debug!(slide = %id, %kind, "outro");
        self.animate(kind)
    }
}
