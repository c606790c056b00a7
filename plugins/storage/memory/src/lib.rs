use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use encoder_api::{CollaboratorError, Component, StoredStream, StreamStorage};

// ═══════════════════════════════════════════════════════════════
//  MemoryStorage
// ═══════════════════════════════════════════════════════════════

/// Process-local stream storage. Rows live as long as the process, so
/// recovery after a restart finds nothing; meant for development and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rows: RwLock<Vec<StoredStream>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-filled with `rows`, as if a previous run had written them.
    pub fn with_rows(rows: Vec<StoredStream>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    /// Raw rows as stored, sealed keys included.
    pub async fn rows(&self) -> Vec<StoredStream> {
        self.rows.read().await.clone()
    }
}

impl Component for MemoryStorage {
    fn name(&self) -> &str {
        "storage-memory"
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

impl StreamStorage for MemoryStorage {
    fn insert(
        &self,
        row: StoredStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            if rows.iter().any(|r| r.uid == row.uid) {
                return Err(CollaboratorError::conflict(format!("uid '{}' already stored", row.uid)));
            }
            rows.push(row);
            Ok(())
        })
    }

    fn delete(
        &self,
        uid: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        let uid = uid.to_string();
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            match rows.iter().position(|r| r.uid == uid) {
                Some(idx) => {
                    rows.remove(idx);
                    Ok(())
                }
                None => Err(CollaboratorError::not_found(format!("uid '{uid}' not stored"))),
            }
        })
    }

    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<StoredStream>, CollaboratorError>> + Send + '_>> {
        Box::pin(async move { Ok(self.rows.read().await.clone()) })
    }
}
