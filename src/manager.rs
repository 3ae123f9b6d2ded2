//! Resource manager: enumeration, transport factory and open-resource registry
//!
//! Open transports are shared as `Arc<tokio::sync::Mutex<Box<dyn Transport>>>`
//! so the session layer and direct callers can hold the same handle. A
//! resource can be open at most once per manager; a second `open` of a
//! resource that is still open reports `Connect { Busy }`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::discovery::{Discovery, SystemDiscovery};
use crate::error::{ConnectErrorKind, VisaError, VisaResult};
use crate::resource::{matches_pattern, ResourceAddress, SerialPort, DEFAULT_QUERY};
use crate::transport::simulated::{CommandHandler, SimulatedTransport};
use crate::transport::usbtmc::{default_connector, TmcConnector};
use crate::transport::{
    SerialTransport, TcpIpTransport, Transport, TransportOptions, TransportState, UsbTmcTransport,
};

/// Transport handle shared between the manager, sessions and callers.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Entry point for discovering and opening resources.
///
/// Keeps one transport per canonical resource string; a second `open` of a
/// resource that is still open fails with `Connect { Busy }`.
pub struct ResourceManager {
    defaults: TransportOptions,
    discovery: Arc<dyn Discovery>,
    usb_connector: Arc<dyn TmcConnector>,
    simulated: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    open: std::sync::Mutex<HashMap<String, Slot>>,
}

/// Entry of the open-resource table.
enum Slot {
    /// Claimed by an `open_with` that is still connecting.
    Opening,
    Ready(SharedTransport),
}

/// An `Opening` claim on a resource key. Dropped without [`Reservation::commit`]
/// (failed or cancelled open) it frees the key again.
struct Reservation<'a> {
    table: &'a std::sync::Mutex<HashMap<String, Slot>>,
    key: String,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, transport: SharedTransport) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.key.clone(), Slot::Ready(transport));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(table.get(&self.key), Some(Slot::Opening)) {
            table.remove(&self.key);
        }
    }
}

impl ResourceManager {
    /// Manager using the OS for discovery and `defaults` for every open.
    pub fn new(defaults: TransportOptions) -> Self {
        Self {
            defaults,
            discovery: Arc::new(SystemDiscovery),
            usb_connector: default_connector(),
            simulated: RwLock::new(HashMap::new()),
            open: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Replace the hardware discovery source.
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Replace the connector used to reach USB-TMC devices.
    pub fn with_usb_connector(mut self, connector: Arc<dyn TmcConnector>) -> Self {
        self.usb_connector = connector;
        self
    }

    /// Options used by [`open`](Self::open).
    pub fn defaults(&self) -> &TransportOptions {
        &self.defaults
    }

    /// Make `SIM::{name}::INSTR` available, answered by `handler`.
    pub fn register_simulated(&self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let name = name.into();
        debug!(name = %name, "Registered simulated device");
        self.simulated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, handler);
    }

    /// Withdraw a simulated device. Already-open transports keep working.
    pub fn unregister_simulated(&self, name: &str) -> bool {
        self.simulated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    fn simulated_handler(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.simulated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Canonical resource strings of attached hardware and registered
    /// simulated devices matching `query` (default `?*::INSTR`).
    ///
    /// TCP/IP instruments cannot be enumerated and are never listed.
    ///
    /// # Errors
    /// Failures of the OS enumeration.
    pub async fn list_resources(&self, query: Option<&str>) -> VisaResult<Vec<String>> {
        let query = query.unwrap_or(DEFAULT_QUERY);

        let discovery = self.discovery.clone();
        let (ports, usb) = tokio::task::spawn_blocking(move || {
            Ok::<_, VisaError>((discovery.serial_ports()?, discovery.usb_devices()?))
        })
        .await
        .map_err(|e| VisaError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        let mut resources: Vec<String> = usb
            .iter()
            .map(|d| d.resource_address().build())
            .chain(ports.iter().filter_map(|p| p.resource_address()).map(|a| a.build()))
            .collect();

        let mut simulated: Vec<String> = self
            .simulated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|name| ResourceAddress::Simulated { name: name.clone() }.build())
            .collect();
        simulated.sort();
        resources.extend(simulated);

        resources.retain(|r| matches_pattern(r, query));
        resources.dedup();
        Ok(resources)
    }

    /// Create a closed transport for `resource`.
    ///
    /// # Errors
    /// `Parse` for malformed strings, `Connect { NotFound }` for unknown
    /// simulated devices.
    pub async fn create_transport(
        &self,
        resource: &str,
        options: TransportOptions,
    ) -> VisaResult<Box<dyn Transport>> {
        let address = ResourceAddress::parse(resource)?;
        let transport: Box<dyn Transport> = match &address {
            ResourceAddress::Usb { .. } => Box::new(UsbTmcTransport::new(
                &address,
                options.settings,
                options.quirks,
                self.usb_connector.clone(),
            )?),
            ResourceAddress::Serial { port } => {
                let ports = if matches!(port, SerialPort::Index(_)) {
                    let discovery = self.discovery.clone();
                    match tokio::task::spawn_blocking(move || discovery.serial_ports()).await {
                        Ok(Ok(ports)) => ports,
                        Ok(Err(e)) => {
                            warn!(resource, error = %e, "Serial enumeration failed, using platform port names");
                            Vec::new()
                        }
                        Err(e) => {
                            warn!(resource, error = %e, "Serial enumeration task failed");
                            Vec::new()
                        }
                    }
                } else {
                    Vec::new()
                };
                Box::new(SerialTransport::for_address(
                    &address,
                    &ports,
                    options.settings,
                    options.serial,
                )?)
            }
            ResourceAddress::TcpipSocket { .. } | ResourceAddress::TcpipInstr { .. } => {
                Box::new(TcpIpTransport::new(&address, options.settings)?)
            }
            ResourceAddress::Simulated { name } => {
                let handler = self
                    .simulated_handler(name)
                    .ok_or_else(|| VisaError::connect(&address.build(), ConnectErrorKind::NotFound))?;
                Box::new(SimulatedTransport::new(address.build(), handler, options.settings))
            }
        };
        Ok(transport)
    }

    /// Open `resource` with the manager's default options.
    pub async fn open(&self, resource: &str) -> VisaResult<SharedTransport> {
        self.open_with(resource, self.defaults.clone()).await
    }

    /// Open `resource` with explicit options.
    ///
    /// # Errors
    /// `Connect { Busy }` when the resource is already open through this
    /// manager, otherwise whatever the transport's `open` reports.
    pub async fn open_with(&self, resource: &str, options: TransportOptions) -> VisaResult<SharedTransport> {
        let key = ResourceAddress::normalize(resource)?;
        options.settings.validate()?;

        // Only the key claim happens under the table lock.
        let (reservation, stale) = self.reserve(&key)?;
        if let Some(stale) = stale {
            if let Err(e) = stale.lock().await.close().await {
                warn!(resource = %key, error = %e, "Closing failed transport");
            }
        }

        let mut transport = self.create_transport(&key, options).await?;
        transport.open().await?;
        info!(resource = %key, "Resource opened");

        let shared: SharedTransport = Arc::new(Mutex::new(transport));
        reservation.commit(shared.clone());
        Ok(shared)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key` for opening. A registered transport that failed or was
    /// closed by its holder is replaced; a failed one is handed back to be closed.
    fn reserve(&self, key: &str) -> VisaResult<(Reservation<'_>, Option<SharedTransport>)> {
        let busy = || VisaError::connect(key, ConnectErrorKind::Busy);
        let mut table = self.table();
        let stale = match table.get(key) {
            None => None,
            Some(Slot::Opening) => return Err(busy()),
            Some(Slot::Ready(existing)) => {
                let state = match existing.try_lock() {
                    Ok(transport) => transport.state(),
                    Err(_) => return Err(busy()),
                };
                match state {
                    TransportState::Open | TransportState::Opening => return Err(busy()),
                    TransportState::Error => Some(existing.clone()),
                    TransportState::Closed | TransportState::Closing => None,
                }
            }
        };
        table.insert(key.to_string(), Slot::Opening);
        Ok((
            Reservation {
                table: &self.open,
                key: key.to_string(),
                committed: false,
            },
            stale,
        ))
    }

    /// Close and forget `resource`. Returns false if it was not open.
    pub async fn close(&self, resource: &str) -> VisaResult<bool> {
        let key = ResourceAddress::normalize(resource)?;
        let removed = {
            let mut table = self.table();
            match table.get(&key) {
                Some(Slot::Ready(_)) => table.remove(&key),
                _ => None,
            }
        };
        match removed {
            Some(Slot::Ready(transport)) => {
                transport.lock().await.close().await?;
                info!(resource = %key, "Resource closed");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Close every open resource. Opens still in progress are left alone.
    pub async fn close_all(&self) {
        let mut drained: Vec<(String, SharedTransport)> = Vec::new();
        {
            let mut table = self.table();
            let keys: Vec<String> = table
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(Slot::Ready(transport)) = table.remove(&key) {
                    drained.push((key, transport));
                }
            }
        }
        for (key, transport) in drained {
            if let Err(e) = transport.lock().await.close().await {
                warn!(resource = %key, error = %e, "Close failed");
            }
        }
    }

    /// Canonical strings of the resources currently open.
    pub async fn open_resources(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .table()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(TransportOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{SerialPortInfo, StaticDiscovery, UsbDeviceInfo};
    use crate::transport::simulated::HandlerReply;
    use crate::transport::usbtmc::testing::{FakeConnector, FakeInstrument};
    use std::time::{Duration, Instant};

    const SCOPE: &str = "USB0::0x0957::0x1796::MY123::INSTR";

    fn echo() -> Arc<dyn CommandHandler> {
        Arc::new(|cmd: &str| HandlerReply::respond(cmd.to_string()))
    }

    fn manager() -> ResourceManager {
        let discovery = Arc::new(StaticDiscovery::new());
        discovery.set_serial_ports(vec![SerialPortInfo {
            path: "/dev/ttyUSB0".into(),
        }]);
        discovery.set_usb_devices(vec![UsbDeviceInfo {
            vendor_id: 0x0957,
            product_id: 0x1796,
            serial_number: Some("MY123".into()),
            interface_number: 0,
        }]);
        ResourceManager::default().with_discovery(discovery)
    }

    #[tokio::test]
    async fn test_list_resources_filters_by_query() {
        let manager = manager();
        manager.register_simulated("dmm", echo());

        let all = manager.list_resources(None).await.unwrap();
        assert_eq!(
            all,
            vec![
                "USB0::0x0957::0x1796::MY123::INSTR".to_string(),
                "ASRL/dev/ttyUSB0::INSTR".to_string(),
                "SIM::dmm::INSTR".to_string(),
            ]
        );

        let usb = manager.list_resources(Some("usb?*")).await.unwrap();
        assert_eq!(usb, vec!["USB0::0x0957::0x1796::MY123::INSTR".to_string()]);
    }

    #[tokio::test]
    async fn test_open_twice_is_busy() {
        let manager = manager();
        manager.register_simulated("dmm", echo());

        let transport = manager.open("sim::dmm::instr").await.unwrap();
        assert_eq!(transport.lock().await.resource_name(), "SIM::dmm::INSTR");

        let err = manager.open("SIM::dmm::INSTR").await.err().expect("second open is refused");
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Busy));

        assert!(manager.close("SIM::dmm::INSTR").await.unwrap());
        assert!(manager.open("SIM::dmm::INSTR").await.is_ok());
    }

    #[tokio::test]
    async fn test_open_unknown_simulated_device() {
        let manager = manager();
        let err = manager.open("SIM::nothing::INSTR").await.err().expect("unknown device is refused");
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::NotFound));
        assert!(manager.open_resources().await.is_empty());

        // The failed attempt released its claim on the key.
        let again = manager.open("SIM::nothing::INSTR").await.err().expect("still unknown");
        assert_eq!(again.connect_kind(), Some(ConnectErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_slow_open_does_not_block_other_resources() {
        let connector = FakeConnector::slow(FakeInstrument::new(), Duration::from_millis(500));
        let manager = Arc::new(manager().with_usb_connector(connector));
        manager.register_simulated("dmm", echo());

        let usb = tokio::spawn({
            let manager = manager.clone();
            async move { manager.open(SCOPE).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        manager.open("SIM::dmm::INSTR").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));

        let err = manager.open(SCOPE).await.err().expect("open already in progress");
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Busy));
        assert_eq!(manager.open_resources().await, vec!["SIM::dmm::INSTR".to_string()]);

        usb.await.unwrap().unwrap();
        assert_eq!(
            manager.open_resources().await,
            vec!["SIM::dmm::INSTR".to_string(), SCOPE.to_string()]
        );
    }

    #[tokio::test]
    async fn test_open_usb_through_connector() {
        let device = FakeInstrument::new().reply(b"ok\n");
        let manager = manager().with_usb_connector(FakeConnector::new(device));

        let transport = manager.open("USB::0x0957::0x1796::MY123::INSTR").await.unwrap();
        let reply = transport.lock().await.query("*OPC?", None).await.unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(manager.open_resources().await, vec![SCOPE.to_string()]);

        manager.close_all().await;
        assert!(manager.open_resources().await.is_empty());
        assert_eq!(transport.lock().await.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_resource() {
        let manager = manager();
        assert!(matches!(
            manager.open("GPIB0::1::INSTR").await,
            Err(VisaError::Parse { .. })
        ));
    }
}
