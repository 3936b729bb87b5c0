//! Cluster-unique connection ports for tcp/udp applications.
use std::{collections::HashSet, ops::RangeInclusive, sync::Mutex};
use crate::{error::{Error, Result}, store::AppStore};

pub struct PortAllocator {
    range: RangeInclusive<u16>,
    /// Ports handed out by this process but possibly not yet persisted.
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self { Self { range, reserved: Mutex::new(HashSet::new()) } }

    /// Uniform draw from the range, re-drawn while it collides with a stored
    /// allocation or an in-flight reservation.
    pub async fn allocate(&self, store: &dyn AppStore) -> Result<u16> {
        let taken = store.allocated_ports().await?;
        let mut reserved = self.reserved.lock().unwrap_or_else(|p| p.into_inner());
        let span = (*self.range.end() - *self.range.start()) as usize + 1;
        if taken.len() + reserved.len() >= span && self.range.clone().all(|p| taken.contains(&p) || reserved.contains(&p)) {
            return Err(Error::upstream("node port range exhausted"));
        }
        loop {
            let port = fastrand::u16(self.range.clone());
            if !taken.contains(&port) && reserved.insert(port) {
                tracing::debug!(port, "port_allocated");
                return Ok(port);
            }
        }
    }

    pub fn release(&self, port: u16) {
        self.reserved.lock().unwrap_or_else(|p| p.into_inner()).remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, ConnectionProtocol};
    use crate::store::MemoryStore;
    use crate::test_support::fixture_app;
    use std::sync::Arc;

    #[tokio::test]
    async fn skips_stored_ports() {
        let store = MemoryStore::new();
        let mut app = fixture_app("t1");
        app.connection = Connection { protocol: ConnectionProtocol::Tcp, port: Some(30000) };
        store.insert_app(app);
        let alloc = PortAllocator::new(30000..=30001);
        assert_eq!(alloc.allocate(&store).await.unwrap(), 30001);
        assert!(alloc.allocate(&store).await.is_err());
        alloc.release(30001);
        assert_eq!(alloc.allocate(&store).await.unwrap(), 30001);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_never_collide() {
        let store = Arc::new(MemoryStore::new());
        let alloc = Arc::new(PortAllocator::new(31000..=31063));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let (s, a) = (store.clone(), alloc.clone());
            handles.push(tokio::spawn(async move { a.allocate(s.as_ref()).await.unwrap() }));
        }
        let mut seen = HashSet::new();
        for h in handles { assert!(seen.insert(h.await.unwrap())); }
        assert_eq!(seen.len(), 64);
    }
}
