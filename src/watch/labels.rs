use std::collections::HashMap;

use tracing::{debug, warn};

use crate::pbx::StatusSource;

/// Peer id -> display name, filled lazily for the life of the process.
///
/// An empty name is a cached "nothing to show" (including failed lookups)
/// and is never looked up again.
#[derive(Debug, Default)]
pub struct LabelCache {
    names: HashMap<String, String>,
}

impl LabelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Display label for `id`, looking the name up at most once.
    pub async fn resolve<S: StatusSource>(&mut self, source: &S, id: &str) -> String {
        if id.is_empty() {
            return String::new();
        }
        if let Some(name) = self.cached(id) {
            return format_label(id, name);
        }

        let name = match source.peer_name(id).await {
            Ok(name) => name,
            Err(e) => {
                warn!("Peer name lookup failed for {}: {}", id, e);
                String::new()
            }
        };
        debug!("Cached label for peer {}: {:?}", id, name);

        let label = format_label(id, &name);
        self.names.insert(id.to_string(), name);
        label
    }
}

/// "Name(id)" when a name is known, bare id otherwise.
pub fn format_label(id: &str, name: &str) -> String {
    if name.is_empty() {
        id.to_string()
    } else {
        format!("{}({})", name, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pbx::{FetchError, PbxError};
    use crate::watch::Snapshot;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Name source that counts lookups; ids starting with "x" fail.
    #[derive(Default)]
    struct Names {
        lookups: AtomicU32,
    }

    impl StatusSource for Names {
        async fn peer_statuses(&self) -> Result<Snapshot, PbxError> {
            Ok(Snapshot::new())
        }

        async fn provider_statuses(&self) -> Result<Snapshot, PbxError> {
            Ok(Snapshot::new())
        }

        async fn peer_name(&self, id: &str) -> Result<String, PbxError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match id {
                "201" => Ok("Reception".to_string()),
                id if id.starts_with('x') => Err(PbxError::Fetch(FetchError::DeadlineExceeded {
                    elapsed: std::time::Duration::from_secs(1),
                })),
                _ => Ok(String::new()),
            }
        }
    }

    #[test]
    fn test_format_label() {
        assert_eq!(format_label("201", "Reception"), "Reception(201)");
        assert_eq!(format_label("201", ""), "201");
    }

    #[tokio::test]
    async fn test_resolve_named_peer() {
        let source = Names::default();
        let mut cache = LabelCache::new();
        assert_eq!(cache.resolve(&source, "201").await, "Reception(201)");
        assert_eq!(cache.cached("201"), Some("Reception"));
    }

    #[tokio::test]
    async fn test_resolve_is_cached() {
        let source = Names::default();
        let mut cache = LabelCache::new();
        for _ in 0..3 {
            assert_eq!(cache.resolve(&source, "201").await, "Reception(201)");
        }
        assert_eq!(source.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unnamed_peer_cached_as_empty() {
        let source = Names::default();
        let mut cache = LabelCache::new();
        assert_eq!(cache.resolve(&source, "202").await, "202");
        assert_eq!(cache.resolve(&source, "202").await, "202");
        assert_eq!(cache.cached("202"), Some(""));
        assert_eq!(source.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_not_retried() {
        let source = Names::default();
        let mut cache = LabelCache::new();
        assert_eq!(cache.resolve(&source, "x9").await, "x9");
        assert_eq!(cache.resolve(&source, "x9").await, "x9");
        assert_eq!(cache.cached("x9"), Some(""));
        assert_eq!(source.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_id_skips_lookup() {
        let source = Names::default();
        let mut cache = LabelCache::new();
        assert_eq!(cache.resolve(&source, "").await, "");
        assert!(cache.is_empty());
        assert_eq!(source.lookups.load(Ordering::SeqCst), 0);
    }
}
