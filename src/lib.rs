pub mod backlinks;
pub mod backup;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod metadata;
pub mod render;
pub mod transfer;
pub mod types;

pub use cache::NotesCache;
pub use config::Config;
pub use db::{NoteStore, SqliteNoteStore};
pub use error::{Error, Result};
pub use render::MarkdownRenderer;
pub use types::{Note, NoteMetadata, NotePatch};

/// Install the global tracing subscriber.
pub fn init_logging() {
    // Only log WARN and above in production to avoid leaking note content
    #[cfg(debug_assertions)]
    tracing_subscriber::fmt::init();
    #[cfg(not(debug_assertions))]
    tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();
}
