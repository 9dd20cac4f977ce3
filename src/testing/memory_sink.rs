use crate::ci::artifacts::ArtifactSink;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Artifact sink that keeps everything in memory.
#[derive(Default)]
pub struct MemoryArtifactSink {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl ArtifactSink for MemoryArtifactSink {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }
}
