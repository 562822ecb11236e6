//! Registry of attached segments

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::error::{Result, ShmError};

use super::{
    config::{BackingType, SegmentConfig},
    segment::{Segment, SegmentStats},
};

/// Process-local registry mapping identifiers to attached segments
///
/// Segments are shared as `Arc<Segment>`; removing one from the registry
/// detaches it once the last clone is dropped.
#[derive(Debug, Default)]
pub struct SegmentManager {
    segments: RwLock<HashMap<String, Arc<Segment>>>,
}

impl SegmentManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Segment>>> {
        self.segments.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Segment>>> {
        self.segments.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a segment and register it under its identifier
    pub fn attach(&self, config: SegmentConfig) -> Result<Arc<Segment>> {
        let identifier = config.identifier.clone();
        if self.read().contains_key(&identifier) {
            return Err(ShmError::segment_exists(&identifier));
        }

        let segment = Arc::new(Segment::attach(config)?);

        let mut segments = self.write();
        if segments.contains_key(&identifier) {
            return Err(ShmError::segment_exists(&identifier));
        }
        segments.insert(identifier, Arc::clone(&segment));
        Ok(segment)
    }

    /// Get an attached segment
    pub fn get(&self, identifier: &str) -> Result<Arc<Segment>> {
        self.try_get(identifier)
            .ok_or_else(|| ShmError::segment_not_found(identifier))
    }

    /// Get an attached segment (returns None if not attached)
    pub fn try_get(&self, identifier: &str) -> Option<Arc<Segment>> {
        self.read().get(identifier).cloned()
    }

    /// Forget a segment
    pub fn detach(&self, identifier: &str) -> Result<()> {
        self.write()
            .remove(identifier)
            .map(|_| ())
            .ok_or_else(|| ShmError::segment_not_found(identifier))
    }

    /// Check if a segment is attached
    pub fn contains(&self, identifier: &str) -> bool {
        self.read().contains_key(identifier)
    }

    /// Identifiers of all attached segments
    pub fn list(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.read().keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    /// Number of attached segments
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Detach every segment
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Statistics of every attached segment
    pub fn stats(&self) -> Vec<SegmentStats> {
        self.read().values().map(|segment| segment.stats()).collect()
    }

    /// Sum of the mapped sizes
    pub fn total_mapped(&self) -> usize {
        self.read().values().map(|segment| segment.size()).sum()
    }

    /// Flush every file-backed segment
    pub fn flush_all(&self) -> Result<()> {
        for segment in self.read().values() {
            if segment.backing_type() == BackingType::FileBacked {
                segment.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memfd(identifier: &str) -> SegmentConfig {
        SegmentConfig::new(identifier)
            .with_backing_type(BackingType::MemFd)
            .with_orders(4, 12)
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_register_and_detach() {
        let manager = SegmentManager::new();
        assert!(manager.is_empty());

        let a = manager.attach(memfd("a")).unwrap();
        manager.attach(memfd("b")).unwrap();
        assert_eq!(manager.list(), vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(
            manager.attach(memfd("a")),
            Err(ShmError::SegmentExists { .. })
        ));

        assert!(Arc::ptr_eq(&manager.get("a").unwrap(), &a));
        assert_eq!(manager.total_mapped(), 2 * a.size());
        assert_eq!(manager.stats().len(), 2);
        manager.flush_all().unwrap();

        manager.detach("a").unwrap();
        assert!(!manager.contains("a"));
        assert!(matches!(manager.get("a"), Err(ShmError::SegmentNotFound { .. })));
        assert!(manager.detach("a").is_err());

        manager.clear();
        assert_eq!(manager.len(), 0);
    }
}
