use std::collections::BTreeMap;

/// Device suffixes reserved for data volumes, `/dev/xvdba` to `/dev/xvdcz`
pub fn data_device_names() -> impl Iterator<Item = String> {
    ['b', 'c'].into_iter().flat_map(|first| {
        ('a'..='z').map(move |second| format!("{first}{second}"))
    })
}

/// Hands out the least recently used free device of a node
#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    last_used: BTreeMap<String, u64>,
    counter: u64,
}

impl Default for DeviceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator {
    pub fn new() -> Self {
        let last_used = data_device_names()
            .enumerate()
            .map(|(index, name)| (name, index as u64))
            .collect::<BTreeMap<_, _>>();
        let counter = last_used.len() as u64;

        Self { last_used, counter }
    }

    /// `None` when every device is taken
    pub fn next_device<V>(&self, existing: &BTreeMap<String, V>) -> Option<String> {
        self.last_used
            .iter()
            .filter(|(name, _)| !existing.contains_key(*name))
            .min_by_key(|(_, last_used)| **last_used)
            .map(|(name, _)| name.to_owned())
    }

    /// Moves the device to the back of the preference order
    pub fn deprioritize(&mut self, device: &str) {
        if let Some(last_used) = self.last_used.get_mut(device) {
            *last_used = self.counter;
            self.counter += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{data_device_names, DeviceAllocator};

    #[test]
    fn data_devices_use_two_letter_suffixes() {
        let names = data_device_names().collect::<Vec<_>>();

        assert_eq!(52, names.len());
        assert_eq!("ba", names[0]);
        assert_eq!("cz", names[51]);
    }

    #[test]
    fn existing_devices_are_skipped() {
        let allocator = DeviceAllocator::new();
        let existing = BTreeMap::from([
            ("a".to_owned(), "vol-root"),
            ("ba".to_owned(), "vol-1"),
        ]);

        assert_eq!(Some("bb".to_owned()), allocator.next_device(&existing));
    }

    #[test]
    fn deprioritized_devices_come_last() {
        let mut allocator = DeviceAllocator::new();
        allocator.deprioritize("ba");

        assert_eq!(Some("bb".to_owned()), allocator.next_device(&BTreeMap::<String, String>::new()));
    }

    #[test]
    fn exhausted_allocator_returns_nothing() {
        let allocator = DeviceAllocator::new();
        let existing = data_device_names()
            .map(|name| (name, ()))
            .collect::<BTreeMap<_, _>>();

        assert_eq!(None, allocator.next_device(&existing));
    }
}
