// In-memory PolicyStore for tests and local runs.

use crate::core::policy::{PolicyError, PolicySection, PolicyStore, StoredPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct InMemoryPolicyStore {
    // (guild, section name) -> (section, document, revision)
    sections: DashMap<(u64, &'static str), (PolicySection, serde_json::Value, i64)>,
    revision: AtomicI64,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn revision(&self, guild_id: u64) -> Result<i64, PolicyError> {
        Ok(self
            .sections
            .iter()
            .filter(|e| e.key().0 == guild_id)
            .map(|e| e.value().2)
            .max()
            .unwrap_or(0))
    }

    async fn load_sections(&self, guild_id: u64) -> Result<StoredPolicy, PolicyError> {
        let mut stored = StoredPolicy::default();
        for entry in self.sections.iter().filter(|e| e.key().0 == guild_id) {
            let (section, value, revision) = entry.value();
            stored.sections.push((*section, value.clone()));
            stored.revision = stored.revision.max(*revision);
        }
        Ok(stored)
    }

    async fn save_section(
        &self,
        guild_id: u64,
        section: PolicySection,
        value: serde_json::Value,
    ) -> Result<i64, PolicyError> {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.sections
            .insert((guild_id, section.as_str()), (section, value, revision));
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn revision_tracks_latest_save_per_guild() {
        let store = InMemoryPolicyStore::new();
        assert_eq!(store.revision(1).await.unwrap(), 0);

        store
            .save_section(1, PolicySection::General, json!({ "enabled": false }))
            .await
            .unwrap();
        store
            .save_section(2, PolicySection::General, json!({}))
            .await
            .unwrap();

        assert_eq!(store.revision(1).await.unwrap(), 1);
        assert_eq!(store.revision(2).await.unwrap(), 2);
        assert_eq!(store.load_sections(1).await.unwrap().sections.len(), 1);
    }
}
