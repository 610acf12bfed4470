use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{StagingError, StagingStore};

/// In-memory staging store, always available for tests.
pub struct MemoryStagingStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl MemoryStagingStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_owned(),
            objects: Mutex::new(BTreeMap::new()),
            fail_puts: AtomicBool::new(false),
        }
    }

    /// Make subsequent puts fail, to simulate transient staging outages.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().expect("MemoryStagingStore lock poisoned")
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<String, StagingError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StagingError::OperationFailed(format!(
                "put {key}: injected failure"
            )));
        }
        self.lock().insert(key.to_owned(), data);
        Ok(format!("mem://{}/{}", self.bucket, key))
    }

    async fn delete(&self, key: &str) -> Result<(), StagingError> {
        match self.lock().remove(key) {
            Some(_) => Ok(()),
            None => Err(StagingError::NotFound(key.to_owned())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StagingError> {
        Ok(self
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
