use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_PORT_RANGE_START: u16 = 8000;
pub const DEFAULT_PORT_RANGE_END: u16 = 9000;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Well-known service ports and common dev-tool ports, never handed out.
pub const RESERVED_PORTS: &[u16] = &[
    22, 23, 25, 53, 67, 68, 80, 123, 143, 161, 162, 389, 443, 465, 587, 636, 993, 995, 3306,
    3389, 5432, 5984, 6379, 27017, 27018, 27019, 27020, 3000, 4200, 5000, 5005, 8080, 8443, 9000,
    9090, 9200, 9300,
];

pub fn is_reserved(port: u16) -> bool {
    RESERVED_PORTS.contains(&port)
}

/// Result of probing a port on the loopback interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Free,
    InUse,
    /// Timed out or failed for another reason; the candidate is skipped.
    Inconclusive,
}

pub trait PortProbe: Send + Sync {
    fn probe(&self, port: u16) -> PortState;
}

/// Probes by connecting to `127.0.0.1:port`. Refused means free, accepted means
/// in use. The answer is advisory: the port can be taken right after.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl PortProbe for TcpProbe {
    fn probe(&self, port: u16) -> PortState {
        let addr = SockAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(port, "Failed to create probe socket: {}", e);
                return PortState::Inconclusive;
            }
        };
        match socket.connect_timeout(&addr, self.timeout) {
            Ok(()) => PortState::InUse,
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => PortState::Free,
            Err(e) => {
                tracing::debug!(port, "Port probe inconclusive: {}", e);
                PortState::Inconclusive
            }
        }
    }
}

#[derive(Debug, Default)]
struct AllocationTable {
    allocated_ports: BTreeSet<u16>,
    port_mappings: BTreeMap<String, u16>,
}

impl AllocationTable {
    fn insert(&mut self, key: &str, port: u16) {
        self.allocated_ports.insert(port);
        self.port_mappings.insert(key.to_string(), port);
    }

    fn is_mapped(&self, port: u16) -> bool {
        self.port_mappings.values().any(|&p| p == port)
    }
}

/// Hands out ports from `[start, end)` keyed by allocation key.
///
/// Check-and-insert happens under one lock, so concurrent callers never get
/// the same port from `allocate`.
pub struct PortAllocator {
    start_port: u16,
    end_port: u16,
    probe: Box<dyn PortProbe>,
    table: Mutex<AllocationTable>,
}

impl PortAllocator {
    pub fn new(start_port: u16, end_port: u16) -> Self {
        Self::with_probe(start_port, end_port, TcpProbe::default())
    }

    pub fn with_probe(start_port: u16, end_port: u16, probe: impl PortProbe + 'static) -> Self {
        Self {
            start_port,
            end_port,
            probe: Box::new(probe),
            table: Mutex::new(AllocationTable::default()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start_port, self.end_port)
    }

    fn lock(&self) -> Option<MutexGuard<'_, AllocationTable>> {
        match self.table.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::error!("Port allocator lock poisoned: {}", e);
                None
            }
        }
    }

    fn available_in(&self, table: &AllocationTable, port: u16) -> bool {
        if port == 0 || table.allocated_ports.contains(&port) || is_reserved(port) {
            return false;
        }
        match self.probe.probe(port) {
            PortState::Free => true,
            PortState::InUse => {
                tracing::debug!(port, "Port is bound by another process");
                false
            }
            PortState::Inconclusive => false,
        }
    }

    pub fn is_port_available(&self, port: u16) -> bool {
        self.lock().map(|t| self.available_in(&t, port)).unwrap_or(false)
    }

    /// Returns the existing port for `key`, else the preferred port if available,
    /// else the first available port in range. `None` means the range is exhausted.
    pub fn allocate(&self, key: &str, preferred_port: Option<u16>) -> Option<u16> {
        let mut table = self.lock()?;
        if let Some(&port) = table.port_mappings.get(key) {
            return Some(port);
        }

        if let Some(preferred) = preferred_port.filter(|&p| p != 0) {
            if self.available_in(&table, preferred) {
                table.insert(key, preferred);
                tracing::info!(key, port = preferred, source = "preferred", "Allocated port");
                return Some(preferred);
            }
        }

        for port in self.start_port..self.end_port {
            if self.available_in(&table, port) {
                table.insert(key, port);
                tracing::info!(key, port, source = "automatic", "Allocated port");
                return Some(port);
            }
        }

        tracing::error!(
            key,
            "No free port in range {}-{}",
            self.start_port,
            self.end_port
        );
        None
    }

    /// Records `key -> port` without any availability check and returns the
    /// previous port of `key`. Collisions created this way show up in
    /// [`PortAllocator::find_conflicts`].
    pub fn assign(&self, key: &str, port: u16) -> Option<u16> {
        let mut table = self.lock()?;
        let previous = table.port_mappings.insert(key.to_string(), port);
        table.allocated_ports.insert(port);
        if let Some(old) = previous.filter(|&old| old != port) {
            if !table.is_mapped(old) {
                table.allocated_ports.remove(&old);
            }
        }
        previous
    }

    pub fn release(&self, key: &str) -> bool {
        let Some(mut table) = self.lock() else {
            return false;
        };
        let Some(port) = table.port_mappings.remove(key) else {
            tracing::warn!(key, "No port allocated for key");
            return false;
        };
        if !table.is_mapped(port) {
            table.allocated_ports.remove(&port);
        }
        tracing::info!(key, port, "Released port");
        true
    }

    pub fn get_port(&self, key: &str) -> Option<u16> {
        self.lock()?.port_mappings.get(key).copied()
    }

    pub fn all_ports(&self) -> BTreeMap<String, u16> {
        self.lock().map(|t| t.port_mappings.clone()).unwrap_or_default()
    }

    /// First port `allocate` would pick, without allocating it.
    pub fn next_available(&self) -> Option<u16> {
        let table = self.lock()?;
        (self.start_port..self.end_port).find(|&p| self.available_in(&table, p))
    }

    /// Range size minus ports currently allocated inside the range.
    pub fn available_count(&self) -> usize {
        let size = usize::from(self.end_port.saturating_sub(self.start_port));
        let used = self
            .lock()
            .map(|t| {
                t.allocated_ports
                    .range(self.start_port..self.end_port.max(self.start_port))
                    .count()
            })
            .unwrap_or(0);
        size.saturating_sub(used)
    }

    /// Ports mapped from more than one key.
    pub fn find_conflicts(&self) -> BTreeMap<u16, Vec<String>> {
        let Some(table) = self.lock() else {
            return BTreeMap::new();
        };
        let mut by_port: BTreeMap<u16, Vec<String>> = BTreeMap::new();
        for (key, &port) in &table.port_mappings {
            by_port.entry(port).or_default().push(key.clone());
        }
        by_port.retain(|_, keys| keys.len() > 1);
        by_port
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END)
    }
}
