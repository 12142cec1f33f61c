//! Producer side of the persistence path

use super::store::{PersistItem, StorageError};
use tokio::sync::mpsc;

/// Where the pipeline hands finished items
pub trait PersistSink {
    fn submit(&mut self, item: PersistItem) -> Result<(), StorageError>;
}

/// Collects items in memory
impl PersistSink for Vec<PersistItem> {
    fn submit(&mut self, item: PersistItem) -> Result<(), StorageError> {
        self.push(item);
        Ok(())
    }
}

/// Feeds the async writer from a synchronous producer thread
///
/// Blocks while the channel is full, so a slow writer backpressures
/// ingestion instead of dropping items. Must not be called from inside an
/// async task.
impl PersistSink for mpsc::Sender<PersistItem> {
    fn submit(&mut self, item: PersistItem) -> Result<(), StorageError> {
        self.blocking_send(item).map_err(|_| StorageError::Closed)
    }
}
