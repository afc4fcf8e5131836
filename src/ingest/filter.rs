use std::collections::HashSet;

use crate::device::DeviceId;
use crate::tracer::event::EntityKey;

/// Ingestion-time entity filter.
///
/// An explicit allow-list wins. Without one, device keys may still be limited
/// to a tracked set resolved once at startup; other kinds of keys always
/// pass. `allows` is a pure set lookup and never touches sysfs.
#[derive(Debug, Default)]
pub struct EntityFilter {
    allow: Option<HashSet<EntityKey>>,
    tracked: Option<HashSet<DeviceId>>,
}

impl EntityFilter {
    /// Lets every key through.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Keeps only the listed keys. An empty list means no filtering.
    pub fn allow_list(keys: impl IntoIterator<Item = EntityKey>) -> Self {
        let allow: HashSet<EntityKey> = keys.into_iter().collect();
        Self {
            allow: (!allow.is_empty()).then_some(allow),
            tracked: None,
        }
    }

    /// Limits device keys to `devices` whenever no allow-list is set.
    pub fn with_tracked_devices(mut self, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        self.tracked = Some(devices.into_iter().collect());
        self
    }

    #[inline]
    pub fn allows(&self, key: EntityKey) -> bool {
        if let Some(allow) = &self.allow {
            return allow.contains(&key);
        }
        match (&self.tracked, key) {
            (Some(tracked), EntityKey::Device(dev)) => tracked.contains(&dev),
            _ => true,
        }
    }
}
