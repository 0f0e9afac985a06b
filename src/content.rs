//! Content loading seam: turns an extracted bundle directory into something a
//! renderer can show, plus the optional lifecycle hooks the slide supplies.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SlideError;
use crate::slide::SlideId;

/// Opaque renderable produced by a [`ContentLoader`].
#[derive(Clone)]
pub struct ContentHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ContentHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// True when both handles come from the same parse.
    pub fn same_as(&self, other: &ContentHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentHandle")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// Points in the show where a slide's hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    BeforeShow,
    AfterShow,
    BeforeHide,
    AfterHide,
    Loop,
}

/// Lifecycle callbacks a slide may implement. Every method defaults to a
/// no-op, so slides only override what they need.
pub trait SlideHooks: Send + Sync {
    fn before_show(&self) -> Result<()> {
        Ok(())
    }

    fn after_show(&self) -> Result<()> {
        Ok(())
    }

    fn before_hide(&self) -> Result<()> {
        Ok(())
    }

    fn after_hide(&self) -> Result<()> {
        Ok(())
    }

    /// Called periodically while the slide is steady on screen.
    fn on_loop(&self) -> Result<()> {
        Ok(())
    }
}

/// Hooks for slides that define none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl SlideHooks for NoHooks {}

/// Parsed slide content and its hooks.
#[derive(Clone)]
pub struct LoadedContent {
    pub handle: ContentHandle,
    pub hooks: Arc<dyn SlideHooks>,
}

impl LoadedContent {
    pub fn new(handle: ContentHandle) -> Self {
        Self {
            handle,
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn with_hooks(handle: ContentHandle, hooks: Arc<dyn SlideHooks>) -> Self {
        Self { handle, hooks }
    }

    /// Runs one hook; failures are logged and otherwise ignored.
    pub fn run_hook(&self, id: &SlideId, point: HookPoint) {
        let res = match point {
            HookPoint::BeforeShow => self.hooks.before_show(),
            HookPoint::AfterShow => self.hooks.after_show(),
            HookPoint::BeforeHide => self.hooks.before_hide(),
            HookPoint::AfterHide => self.hooks.after_hide(),
            HookPoint::Loop => self.hooks.on_loop(),
        };
        if let Err(err) = res {
            warn!(slide = %id, hook = ?point, error = %err, "slide hook failed");
        }
    }
}

impl fmt::Debug for LoadedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedContent")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    Layout,
    Module,
}

impl ContentMode {
    pub fn entry_file(&self) -> &'static str {
        match self {
            Self::Layout => "layout.json",
            Self::Module => "module.json",
        }
    }
}

impl FromStr for ContentMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "layout" => Ok(Self::Layout),
            "module" => Ok(Self::Module),
            other => Err(other.to_string()),
        }
    }
}

/// Parses an extracted bundle into displayable content.
///
/// `load` is blocking; the manager always calls it from a blocking worker.
pub trait ContentLoader: Send + Sync {
    fn load(&self, id: &SlideId, dir: &Path, mode: &str) -> Result<LoadedContent, SlideError>;

    /// Frees whatever the loader allocated for `content`.
    fn release(&self, id: &SlideId, content: LoadedContent) {
        debug!(slide = %id, "releasing content");
        drop(content);
    }
}

/// Declarative slide layout read from `layout.json`.
#[derive(Debug, Clone)]
pub struct LayoutDocument {
    pub dir: PathBuf,
    pub document: serde_json::Value,
}

/// Builds content for `module` bundles.
pub trait ModuleFactory: Send + Sync {
    fn build(&self, id: &SlideId, dir: &Path, config: &serde_json::Value) -> Result<LoadedContent>;
}

#[derive(Debug, Deserialize)]
struct ModuleEntry {
    module: String,
    #[serde(flatten)]
    config: serde_json::Value,
}

/// Default loader: `layout` bundles carry a `layout.json` document,
/// `module` bundles name a registered [`ModuleFactory`] in `module.json`.
#[derive(Default)]
pub struct BundleContentLoader {
    modules: HashMap<String, Arc<dyn ModuleFactory>>,
}

impl BundleContentLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&mut self, name: impl Into<String>, factory: Arc<dyn ModuleFactory>) {
        self.modules.insert(name.into(), factory);
    }

    fn read_entry(id: &SlideId, dir: &Path, mode: ContentMode) -> Result<serde_json::Value, SlideError> {
        let path = dir.join(mode.entry_file());
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| SlideError::parse(id, format!("{}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| SlideError::parse(id, format!("{}: {err}", path.display())))
    }
}

impl ContentLoader for BundleContentLoader {
    fn load(&self, id: &SlideId, dir: &Path, mode: &str) -> Result<LoadedContent, SlideError> {
        let mode = mode.parse::<ContentMode>().map_err(|mode| SlideError::UnsupportedMode {
            id: id.clone(),
            mode,
        })?;
        let document = Self::read_entry(id, dir, mode)?;
        match mode {
            ContentMode::Layout => {
                debug!(slide = %id, dir = %dir.display(), "parsed layout document");
                Ok(LoadedContent::new(ContentHandle::new(LayoutDocument {
                    dir: dir.to_path_buf(),
                    document,
                })))
            }
            ContentMode::Module => {
                let entry: ModuleEntry = serde_json::from_value(document)
                    .map_err(|err| SlideError::parse(id, format!("module.json: {err}")))?;
                let factory = self.modules.get(&entry.module).ok_or_else(|| {
                    SlideError::UnsupportedMode {
                        id: id.clone(),
                        mode: format!("module:{}", entry.module),
                    }
                })?;
                factory
                    .build(id, dir, &entry.config)
                    .map_err(|err| SlideError::parse(id, format!("{err:#}")))
            }
        }
    }
}
