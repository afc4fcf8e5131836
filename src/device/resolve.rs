use std::sync::Arc;

use dashmap::DashMap;

use super::{syscalls, Sysfs};
use crate::tracer::event::EntityKey;

/// Best-effort, cached mapping from entity keys to display names.
///
/// A failed lookup falls back to the key's raw form and is cached like a
/// successful one, so sysfs is consulted at most once per entity.
pub struct Resolver {
    sysfs: Sysfs,
    groups: Vec<String>,
    cache: DashMap<EntityKey, Arc<str>>,
}

impl Resolver {
    pub fn new(sysfs: Sysfs, groups: Vec<String>) -> Self {
        Self {
            sysfs,
            groups,
            cache: DashMap::with_capacity(64),
        }
    }

    /// Seeds the cache with a name that is already known.
    pub fn insert(&self, key: EntityKey, name: &str) {
        self.cache.insert(key, Arc::from(name));
    }

    pub fn name(&self, key: EntityKey) -> Arc<str> {
        if let Some(name) = self.cache.get(&key) {
            return Arc::clone(&name);
        }

        let name: Arc<str> = match key {
            EntityKey::Device(id) => self
                .sysfs
                .device_name(id)
                .unwrap_or_else(|| id.to_string())
                .into(),
            EntityKey::Syscall(nr) => match syscalls::name(nr) {
                Some(name) => name.into(),
                None => key.to_string().into(),
            },
            EntityKey::Group(idx) => match self.groups.get(usize::from(idx)) {
                Some(name) => name.as_str().into(),
                None => key.to_string().into(),
            },
        };

        self.cache.insert(key, Arc::clone(&name));
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::add_device;
    use crate::device::DeviceId;

    #[test]
    fn test_device_name_and_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        add_device(dir.path(), "sdc", 8, 32, "0 0\n");
        let resolver = Resolver::new(Sysfs::new(dir.path()), Vec::new());

        assert_eq!(
            &*resolver.name(EntityKey::Device(DeviceId::new(8, 32))),
            "sdc"
        );
        assert_eq!(
            &*resolver.name(EntityKey::Device(DeviceId::new(8, 48))),
            "8:48"
        );
    }

    #[test]
    fn test_lookup_is_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        add_device(dir.path(), "sdc", 8, 32, "0 0\n");
        let resolver = Resolver::new(Sysfs::new(dir.path()), Vec::new());
        let key = EntityKey::Device(DeviceId::new(8, 32));

        assert_eq!(&*resolver.name(key), "sdc");
        std::fs::remove_dir_all(dir.path().join("dev")).expect("remove dev");
        assert_eq!(&*resolver.name(key), "sdc");
    }

    #[test]
    fn test_syscall_and_group_names() {
        let resolver = Resolver::new(Sysfs::new("/nonexistent"), vec!["usb".to_string()]);
        assert_eq!(&*resolver.name(EntityKey::Syscall(74)), "fsync");
        assert_eq!(&*resolver.name(EntityKey::Syscall(4242)), "sys_4242");
        assert_eq!(&*resolver.name(EntityKey::Group(0)), "usb");
        assert_eq!(&*resolver.name(EntityKey::Group(3)), "group_3");
    }

    #[test]
    fn test_insert_overrides_lookup() {
        let resolver = Resolver::new(Sysfs::new("/nonexistent"), Vec::new());
        let key = EntityKey::Device(DeviceId::new(8, 0));
        resolver.insert(key, "sda");
        assert_eq!(&*resolver.name(key), "sda");
    }
}
