//! Persistent stores: relational financials, SQL loading, checkpoints

pub mod checkpoint;
pub mod loader;
pub mod relational;

pub use checkpoint::{validate_conversation_id, CheckpointStore, ConversationLocks};
pub use loader::{LoadSummary, SqlLoader};
pub use relational::{QueryOutput, RelationalStore};

/// Ensure the directory for a `sqlite:` URL exists before connecting
pub(crate) fn ensure_sqlite_dir(database_url: &str) -> std::io::Result<()> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        let path = path.split('?').next().unwrap_or(path);
        if path.contains(":memory:") {
            return Ok(());
        }
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}
