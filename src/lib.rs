pub mod bundle;
pub mod config;
pub mod content;
pub mod controller;
pub mod error;
pub mod events;
pub mod manager;
pub mod playlist;
pub mod registry;
pub mod renderer;
pub mod slide;
pub mod tasks {
    pub mod control;
    pub mod show;
}

pub use error::SlideError;
pub use manager::SlideLifecycleManager;
