//! Host context shared by all devices created under one adapter attachment

use std::sync::atomic::{AtomicU32, Ordering};

/// Per-adapter FILEIO state
///
/// Owned by the adapter attach/detach lifecycle. Devices keep only a weak
/// reference to it; the framework guarantees every device is freed before the
/// host is detached.
#[derive(Debug)]
pub struct FdHost {
    host_id: u32,
    dev_id_count: AtomicU32,
}

impl FdHost {
    pub(crate) fn new(host_id: u32) -> Self {
        FdHost {
            host_id,
            dev_id_count: AtomicU32::new(0),
        }
    }

    pub fn host_id(&self) -> u32 {
        self.host_id
    }

    /// Hand out the next device id (post-increment)
    pub(crate) fn next_dev_id(&self) -> u32 {
        self.dev_id_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of device ids handed out so far
    pub fn devices_created(&self) -> u32 {
        self.dev_id_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_dev_ids_are_post_incremented() {
        let host = FdHost::new(7);
        assert_eq!(host.host_id(), 7);
        assert_eq!(host.next_dev_id(), 0);
        assert_eq!(host.next_dev_id(), 1);
        assert_eq!(host.devices_created(), 2);
    }

    #[test]
    fn test_concurrent_dev_ids_are_unique() {
        let host = Arc::new(FdHost::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let host = Arc::clone(&host);
                thread::spawn(move || (0..100).map(|_| host.next_dev_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 800);
        assert_eq!(host.devices_created(), 800);
    }
}
