//! Adapter transport and the shared link
//!
//! A single serial adapter is shared between the request/response path
//! (`ObdClient`) and the bus monitor (CAN sniffer). The `Link` owns the port
//! behind one mutex and tracks whether the monitor currently holds the bus.

use crate::error::ObdError;
use std::io::{self, Read, Write};
use tokio_serial::SerialPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Read timeout of a single serial read call. Higher layers loop until
/// their own deadline, so this only bounds how long the port lock is held.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Byte stream to an ELM327-compatible adapter
///
/// Reads must return `ErrorKind::TimedOut` (or `WouldBlock`) when no data
/// arrives within a short interval rather than blocking indefinitely.
pub trait Transport: Read + Write + Send {
    /// Bytes already received and waiting to be read, without blocking
    fn pending_input(&mut self) -> io::Result<usize>;
}

impl Transport for Box<dyn SerialPort> {
    fn pending_input(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read().map_err(io::Error::from)? as usize)
    }
}

/// Open a serial port in blocking mode with a short read timeout
pub fn open_serial(path: &str, baud_rate: u32) -> Result<Box<dyn Transport>, ObdError> {
    debug!("Opening serial port {} at {} baud", path, baud_rate);
    let port: Box<dyn SerialPort> = tokio_serial::new(path, baud_rate)
        .timeout(READ_POLL_INTERVAL)
        .open()
        .map_err(|e| ObdError::SerialError(format!("{}: {}", path, e)))?;
    Ok(Box::new(port))
}

/// Names of serial ports that may host an adapter
pub fn candidate_ports() -> Vec<String> {
    match tokio_serial::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            debug!("Serial port enumeration failed: {}", e);
            Vec::new()
        }
    }
}

struct LinkInner {
    port: Mutex<Option<Box<dyn Transport>>>,
    port_name: Mutex<Option<String>>,
    /// Custom transmit header programmed into the adapter (`None` = default)
    header: Mutex<Option<String>>,
    monitoring: AtomicBool,
    simulated: AtomicBool,
}

/// Cloneable handle to the one adapter connection
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    /// Create an empty (disconnected) link
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LinkInner {
                port: Mutex::new(None),
                port_name: Mutex::new(None),
                header: Mutex::new(None),
                monitoring: AtomicBool::new(false),
                simulated: AtomicBool::new(false),
            }),
        }
    }

    fn port(&self) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
        self.inner.port.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install an opened transport, replacing any previous one
    pub fn attach(&self, transport: Box<dyn Transport>, name: &str) {
        info!("Link attached to {}", name);
        *self.port() = Some(transport);
        *self.inner.port_name.lock().unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
        self.set_header(None);
        self.inner.simulated.store(false, Ordering::SeqCst);
    }

    /// Mark the link as simulated (no hardware behind it)
    pub fn attach_simulated(&self) {
        self.detach();
        self.inner.simulated.store(true, Ordering::SeqCst);
        *self.inner.port_name.lock().unwrap_or_else(|e| e.into_inner()) =
            Some("simulation".to_string());
    }

    /// Release the transport; idempotent
    pub fn detach(&self) {
        if self.port().take().is_some() {
            info!("Link detached");
        }
        *self.inner.port_name.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_header(None);
        self.inner.simulated.store(false, Ordering::SeqCst);
    }

    /// Whether a real transport is attached
    pub fn is_attached(&self) -> bool {
        self.port().is_some()
    }

    /// Whether the link is a simulation
    pub fn is_simulated(&self) -> bool {
        self.inner.simulated.load(Ordering::SeqCst)
    }

    /// Name of the attached port, if any
    pub fn port_name(&self) -> Option<String> {
        self.inner
            .port_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Transmit header currently programmed into the adapter
    pub fn header(&self) -> Option<String> {
        self.inner
            .header
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record the header after an `ATSH` (`None` after a reset to default)
    pub fn set_header(&self, header: Option<String>) {
        *self.inner.header.lock().unwrap_or_else(|e| e.into_inner()) = header;
    }

    /// Run `f` with exclusive access to the transport
    pub fn with_port<T>(
        &self,
        f: impl FnOnce(&mut dyn Transport) -> Result<T, ObdError>,
    ) -> Result<T, ObdError> {
        let mut guard = self.port();
        match guard.as_mut() {
            Some(port) => f(port.as_mut()),
            None => Err(ObdError::VehicleNotConnected),
        }
    }

    /// Whether the bus monitor currently owns the link
    pub fn is_monitoring(&self) -> bool {
        self.inner.monitoring.load(Ordering::SeqCst)
    }

    /// Claim the link for the bus monitor. Returns `None` if already claimed.
    /// The claim is released when the guard drops.
    pub fn enter_monitor(&self) -> Option<MonitorGuard> {
        self.inner
            .monitoring
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| MonitorGuard { link: self.clone() })
    }
}

/// Proof of monitor ownership; clears the monitor flag on drop
pub struct MonitorGuard {
    link: Link,
}

impl MonitorGuard {
    /// The link this guard belongs to
    pub fn link(&self) -> &Link {
        &self.link
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.link.inner.monitoring.store(false, Ordering::SeqCst);
        debug!("Bus monitor released");
    }
}
