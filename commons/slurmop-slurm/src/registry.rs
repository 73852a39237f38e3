use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{ClusterKey, SlurmApi};

/// Process-wide map from cluster identity to its scheduler client.
///
/// Entries are only ever added or replaced; reconciles read a snapshot.
#[derive(Clone, Default)]
pub struct ClientSet(Arc<RwLock<HashMap<ClusterKey, Arc<dyn SlurmApi>>>>);

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: ClusterKey, client: Arc<dyn SlurmApi>) {
        let mut w = self.0.write().await;
        w.insert(key, client);
    }

    pub async fn get(&self, key: &ClusterKey) -> Option<Arc<dyn SlurmApi>> {
        let r = self.0.read().await;
        r.get(key).cloned()
    }
}
