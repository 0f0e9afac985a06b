use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::content::LoadedContent;
use crate::error::SlideError;

/// Scalar accepted on the wire for ids and timestamps.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<Scalar> for String {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Text(v) => v,
        }
    }
}

/// Stable slide identity. Numbers and strings are normalized to text so
/// `7` and `"7"` name the same slide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Scalar", into = "String")]
pub struct SlideId(String);

impl SlideId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name for this id inside the bundle cache.
    pub fn dir_name(&self) -> String {
        let cleaned: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        match cleaned.as_str() {
            "" | "." | ".." => format!("_{}", cleaned.replace('.', "_")),
            _ => cleaned,
        }
    }
}

impl From<Scalar> for SlideId {
    fn from(value: Scalar) -> Self {
        Self(value.into())
    }
}

impl From<SlideId> for String {
    fn from(value: SlideId) -> Self {
        value.0
    }
}

impl From<&str> for SlideId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for SlideId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SlideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote version marker of a slide's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Scalar", into = "String")]
pub struct SlideVersion(String);

impl SlideVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Scalar> for SlideVersion {
    fn from(value: Scalar) -> Self {
        Self(value.into())
    }
}

impl From<SlideVersion> for String {
    fn from(value: SlideVersion) -> Self {
        value.0
    }
}

impl From<&str> for SlideVersion {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for SlideVersion {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SlideVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionKind {
    #[default]
    Fade,
    SlideLeftRight,
    SlideRightLeft,
    SlideUpDown,
    SlideDownUp,
    None,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fade => "fade",
            Self::SlideLeftRight => "slide-left-right",
            Self::SlideRightLeft => "slide-right-left",
            Self::SlideUpDown => "slide-up-down",
            Self::SlideDownUp => "slide-down-up",
            Self::None => "none",
        }
    }

    pub fn is_animated(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slide description as delivered by the remote control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlideMetadata {
    pub id: SlideId,
    pub url: String,
    /// Display time in seconds.
    pub duration: f64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub transition: TransitionKind,
    pub timestamp: SlideVersion,
    #[serde(default = "SlideMetadata::default_mode")]
    pub mode: String,
}

impl SlideMetadata {
    pub const DEFAULT_MODE: &'static str = "layout";

    fn default_mode() -> String {
        Self::DEFAULT_MODE.to_string()
    }

    pub fn validate(&self) -> Result<(), SlideError> {
        let reason = if !self.duration.is_finite() || self.duration <= 0.0 {
            Some(format!("duration must be positive, got {}", self.duration))
        } else if self.url.trim().is_empty() {
            Some("url must not be empty".to_string())
        } else {
            None
        };
        match reason {
            Some(reason) => Err(SlideError::InvalidMetadata {
                id: self.id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    pub fn display_duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Pending,
    Ready,
    OnScreen,
    Retiring,
    Removed,
}

struct SlideInner {
    meta: SlideMetadata,
    content: Option<LoadedContent>,
    state: LifecycleState,
    visible: bool,
}

/// One displayable unit: metadata, loaded content and its mutation lock.
pub struct Slide {
    id: SlideId,
    lock: Arc<Mutex<()>>,
    inner: RwLock<SlideInner>,
}

impl Slide {
    /// A slide whose bundle is still being fetched.
    pub fn pending(meta: SlideMetadata) -> Arc<Self> {
        Arc::new(Self {
            id: meta.id.clone(),
            lock: Arc::new(Mutex::new(())),
            inner: RwLock::new(SlideInner {
                meta,
                content: None,
                state: LifecycleState::Pending,
                visible: false,
            }),
        })
    }

    pub fn id(&self) -> &SlideId {
        &self.id
    }

    /// Exclusive lock held during load, reload, removal and while the
    /// transition controller animates this slide.
    pub fn lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.lock)
    }

    pub fn metadata(&self) -> SlideMetadata {
        self.inner.read().meta.clone()
    }

    pub fn timestamp(&self) -> SlideVersion {
        self.inner.read().meta.timestamp.clone()
    }

    pub fn duration(&self) -> Duration {
        self.inner.read().meta.display_duration()
    }

    pub fn transition(&self) -> TransitionKind {
        self.inner.read().meta.transition
    }

    pub fn content(&self) -> Option<LoadedContent> {
        self.inner.read().content.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.read().state
    }

    pub fn is_visible(&self) -> bool {
        self.inner.read().visible
    }

    /// Installs freshly parsed content together with the metadata it was
    /// built from, returning the content it replaces.
    pub fn install(&self, meta: SlideMetadata, content: LoadedContent) -> Option<LoadedContent> {
        let mut inner = self.inner.write();
        inner.meta = meta;
        if inner.state == LifecycleState::Pending {
            inner.state = LifecycleState::Ready;
        }
        inner.content.replace(content)
    }

    pub fn take_content(&self) -> Option<LoadedContent> {
        self.inner.write().content.take()
    }

    pub fn mark_on_screen(&self) {
        let mut inner = self.inner.write();
        inner.visible = true;
        if inner.state == LifecycleState::Ready {
            inner.state = LifecycleState::OnScreen;
        }
    }

    pub fn mark_off_screen(&self) {
        let mut inner = self.inner.write();
        inner.visible = false;
        if inner.state == LifecycleState::OnScreen {
            inner.state = LifecycleState::Ready;
        }
    }

    pub fn mark_retiring(&self) {
        let mut inner = self.inner.write();
        if inner.state != LifecycleState::Removed {
            inner.state = LifecycleState::Retiring;
        }
    }

    pub fn mark_removed(&self) {
        let mut inner = self.inner.write();
        inner.state = LifecycleState::Removed;
        inner.visible = false;
    }
}

impl fmt::Debug for Slide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Slide")
            .field("id", &self.id)
            .field("timestamp", &inner.meta.timestamp)
            .field("state", &inner.state)
            .field("visible", &inner.visible)
            .finish()
    }
}
