//! Media download service: fetches videos through yt-dlp, optionally converts them to MP3
//! with ffmpeg and serves the result from a self-cleaning artifact store.

pub mod api;
pub mod config;
pub mod encoder;
pub mod error;
pub mod event_log;
pub mod extractor;
pub mod formats;
pub mod store;
pub mod sweeper;

pub use api::{AppState, router};
pub use config::Config;
pub use error::{Error, Result};
pub use store::{Artifact, ArtifactStore, Token};
