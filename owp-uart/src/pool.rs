use crate::{BitLinkAdapter, NativePort, UartPort, UartResult};
use log::debug;
use owp_onewire::OneWireError;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

type PortFactory<P> = Box<dyn Fn(&str) -> P + Send + Sync>;

/// Adapters keyed by serial port name, at most one per physical port.
///
/// Owned by the application; [`shutdown`](AdapterPool::shutdown) closes every pooled port.
pub struct AdapterPool<P> {
    adapters: Mutex<Option<HashMap<String, Arc<BitLinkAdapter<P>>>>>,
    factory: PortFactory<P>,
}

impl AdapterPool<NativePort> {
    /// A pool of hardware serial ports.
    pub fn native() -> Self {
        Self::new(|name: &str| NativePort::new(name))
    }
}

impl<P: UartPort> AdapterPool<P> {
    /// A pool creating ports with `factory` on first request.
    pub fn new(factory: impl Fn(&str) -> P + Send + Sync + 'static) -> Self {
        Self {
            adapters: Mutex::new(Some(HashMap::new())),
            factory: Box::new(factory),
        }
    }

    /// Returns the adapter for `port_name`, creating it on first request.
    ///
    /// # Errors
    /// [`OneWireError::Closed`] after [`shutdown`](AdapterPool::shutdown).
    pub fn get_or_create(&self, port_name: &str) -> UartResult<Arc<BitLinkAdapter<P>>> {
        let mut guard = self.adapters.lock().unwrap_or_else(PoisonError::into_inner);
        let adapters = guard.as_mut().ok_or(OneWireError::Closed)?;
        let adapter = adapters.entry(port_name.to_owned()).or_insert_with(|| {
            debug!("creating adapter for {port_name}");
            Arc::new(BitLinkAdapter::new((self.factory)(port_name)))
        });
        Ok(adapter.clone())
    }

    /// Number of pooled adapters.
    pub fn len(&self) -> usize {
        self.adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, HashMap::len)
    }

    /// `true` if no adapter has been created, or the pool was shut down.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every pooled adapter, waiting for running transactions, and refuses new requests.
    pub async fn shutdown(&self) {
        let adapters = self
            .adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for (_, adapter) in adapters.into_iter().flatten() {
            adapter.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        OpContext,
        sim::{SimBus, SimDevice},
    };

    fn sim_pool() -> AdapterPool<SimBus> {
        AdapterPool::new(|name| SimBus::new(name, vec![SimDevice::ds18b20(7)]))
    }

    #[test]
    fn one_adapter_per_port() {
        let pool = sim_pool();
        let a = pool.get_or_create("ttyA").unwrap();
        let b = pool.get_or_create("ttyA").unwrap();
        let c = pool.get_or_create("ttyB").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.name(), "ttyA");
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_adapters() {
        let pool = sim_pool();
        let adapter = pool.get_or_create("ttyA").unwrap();
        pool.shutdown().await;
        assert!(adapter.is_closed());
        assert!(pool.is_empty());
        assert!(matches!(pool.get_or_create("ttyA"), Err(OneWireError::Closed)));
        let res = adapter.run_exclusive(&OpContext::new(), |_| Ok(())).await;
        assert!(matches!(res, Err(OneWireError::Closed)));
    }
}
