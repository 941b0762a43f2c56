//! Storage backend trait for persistence.
//!
//! This trait defines the interface for persistence backends,
//! allowing different implementations (fjall, Redis, PostgreSQL, etc.)

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

/// Persistence operation for batch writes
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    /// Set a retained message
    SetRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    /// Delete a retained message
    DeleteRetained { topic: String },
    /// Set a session snapshot, written on disconnect of a non-clean session
    SetSession {
        client_id: String,
        session: StoredSession,
    },
    /// Delete a session, written when a clean session disconnects
    DeleteSession { client_id: String },
}

/// Storage backend trait for persistence
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Retained messages
    // ========================================================================

    /// Get a retained message by topic
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>>;

    /// Set a retained message
    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()>;

    /// Delete a retained message
    async fn delete_retained(&self, topic: &str) -> Result<()>;

    /// List all retained messages
    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>>;

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Get a session by client ID
    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>>;

    /// Set a session
    async fn set_session(&self, client_id: &str, session: &StoredSession) -> Result<()>;

    /// Delete a session
    async fn delete_session(&self, client_id: &str) -> Result<()>;

    /// List all sessions
    async fn list_sessions(&self) -> Result<Vec<(String, StoredSession)>>;

    // ========================================================================
    // Batch operations
    // ========================================================================

    /// Execute a batch of operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush all pending writes to disk
    async fn flush(&self) -> Result<()>;

    /// Close the backend (flush and release resources)
    async fn close(&self) -> Result<()>;

    /// Load all data at startup
    async fn load_all(&self) -> Result<LoadedData> {
        let retained = self.list_retained().await?;
        let sessions = self.list_sessions().await?;

        Ok(LoadedData { retained, sessions })
    }
}
