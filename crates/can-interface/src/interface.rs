//! Frame injection and the background bus monitor
//!
//! The monitor runs on its own OS thread and holds the link's monitor claim
//! for its whole life, so request/response traffic stays off the wire while
//! the adapter is in `ATMA` mode. Lines reach the caller only through the
//! callback.

use crate::error::CanError;
use crate::hex::{frame_data, frame_header};
use obd_protocol::{elm, Link, MonitorGuard, ObdError};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest wait for the adapter's `STOPPED` reply when leaving monitor mode
const INTERRUPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after an empty read so injection can take the port
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Arbitration IDs seen on the simulated bus
const SIMULATED_IDS: [&str; 4] = ["7E8", "0C9", "1A0", "3E9"];

/// Sniffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnifferConfig {
    /// Upper bound on waiting for the worker to exit (ms)
    pub stop_timeout_ms: u64,
    /// Timeout of each injection exchange (ms)
    pub command_timeout_ms: u64,
    /// Lines longer than this are dropped as noise
    pub max_line_len: usize,
    /// Interval between synthesized frames in simulation (ms)
    pub simulated_interval_ms: u64,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 1500,
            command_timeout_ms: 2000,
            max_line_len: 256,
            simulated_interval_ms: 50,
        }
    }
}

impl SnifferConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn simulated_interval(&self) -> Duration {
        Duration::from_millis(self.simulated_interval_ms)
    }
}

/// Lifecycle of the bus monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnifferState {
    Idle,
    Running,
    Stopping,
}

struct Worker {
    cancel: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    exited: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

struct Lifecycle {
    state: SnifferState,
    worker: Option<Worker>,
}

/// Reports the end of a worker thread, however it ends
struct ExitSignal {
    live: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
    exited: mpsc::Sender<()>,
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        let _ = self.exited.send(());
    }
}

/// CAN frame injector and bus monitor on a shared adapter link
pub struct CanInterface {
    link: Link,
    config: SnifferConfig,
    lifecycle: Mutex<Lifecycle>,
    live_workers: Arc<AtomicUsize>,
}

impl CanInterface {
    pub fn new(link: Link, config: SnifferConfig) -> Self {
        Self {
            link,
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: SnifferState::Idle,
                worker: None,
            }),
            live_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The link this interface shares with the OBD client
    pub fn link(&self) -> &Link {
        &self.link
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current monitor state
    pub fn state(&self) -> SnifferState {
        let lifecycle = self.lifecycle();
        match (&lifecycle.state, &lifecycle.worker) {
            (SnifferState::Running, Some(worker)) if !worker.alive.load(Ordering::SeqCst) => {
                SnifferState::Idle
            }
            (state, _) => *state,
        }
    }

    /// True only while a worker is alive and running
    pub fn is_sniffing(&self) -> bool {
        self.state() == SnifferState::Running
    }

    /// Worker threads that have not exited yet
    pub fn active_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Put the adapter in monitor-all mode and stream lines to `callback`
    ///
    /// A no-op while a worker is already running. Lines that are not valid
    /// UTF-8 are dropped.
    pub fn start_sniffing<F>(&self, callback: F) -> Result<(), CanError>
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == SnifferState::Running {
            let alive = lifecycle
                .worker
                .as_ref()
                .map(|w| w.alive.load(Ordering::SeqCst))
                .unwrap_or(false);
            if alive {
                debug!("Bus monitor already running");
                return Ok(());
            }
            if let Some(worker) = lifecycle.worker.take() {
                let _ = worker.handle.join();
            }
            lifecycle.state = SnifferState::Idle;
        }

        let simulated = self.link.is_simulated();
        if !simulated && !self.link.is_attached() {
            return Err(CanError::NotConnected);
        }
        let guard = self.link.enter_monitor().ok_or(CanError::MonitorBusy)?;

        if !simulated {
            self.link.with_port(|port| {
                port.write_all(b"ATMA\r")?;
                port.flush()?;
                Ok(())
            })?;
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let (exit_tx, exit_rx) = mpsc::channel();
        self.live_workers.fetch_add(1, Ordering::SeqCst);
        let exit = ExitSignal {
            live: self.live_workers.clone(),
            alive: alive.clone(),
            exited: exit_tx,
        };

        let config = self.config.clone();
        let cancel_flag = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("can-sniffer".to_string())
            .spawn(move || {
                let _exit = exit;
                if simulated {
                    simulate_bus(guard, &cancel_flag, callback, &config);
                } else {
                    monitor_bus(guard, &cancel_flag, callback, &config);
                }
            })
            .map_err(|e| CanError::Spawn(e.to_string()))?;

        lifecycle.worker = Some(Worker {
            cancel,
            alive,
            exited: exit_rx,
            handle,
        });
        lifecycle.state = SnifferState::Running;
        info!(
            "Bus monitor started on {}",
            self.link.port_name().unwrap_or_default()
        );
        Ok(())
    }

    /// Cancel the worker and wait (bounded) for it to leave monitor mode
    ///
    /// Idempotent.
    pub fn stop_sniffing(&self) {
        let mut lifecycle = self.lifecycle();
        let Some(worker) = lifecycle.worker.take() else {
            lifecycle.state = SnifferState::Idle;
            return;
        };
        lifecycle.state = SnifferState::Stopping;
        worker.cancel.store(true, Ordering::SeqCst);

        match worker.exited.recv_timeout(self.config.stop_timeout()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("Bus monitor worker panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Bus monitor did not exit within {:?}, detaching it",
                    self.config.stop_timeout()
                );
            }
        }

        lifecycle.state = SnifferState::Idle;
        info!("Bus monitor stopped");
    }

    /// Send one raw frame: `ATSH<header>` then the payload
    ///
    /// A running monitor is stopped first, since the adapter cannot transmit
    /// in monitor mode. On a transport fault the monitor is left stopped.
    pub fn inject_frame(&self, header: &str, data: &str) -> Result<String, CanError> {
        let header = frame_header(header)?;
        let data = frame_data(data)?;

        let simulated = self.link.is_simulated();
        if !simulated && !self.link.is_attached() {
            return Err(CanError::NotConnected);
        }
        if self.is_sniffing() {
            info!("Stopping bus monitor for injection");
            self.stop_sniffing();
        }
        if simulated {
            info!("Simulated injection {} {}", header, data);
            return Ok(format!("Sent {} {} (simulated)", header, data));
        }

        let timeout = self.config.command_timeout();
        let result = self.link.with_port(|port| {
            let command = format!("ATSH{}", header);
            let reply = elm::send_command(port, &command, timeout)?;
            if !reply.contains("OK") {
                return Err(ObdError::InvalidResponse(format!("{}: {}", command, reply)));
            }
            self.link.set_header(Some(header.clone()));
            elm::send_command(port, &data, timeout)
        });

        match result {
            Ok(reply) if reply.lines().any(|line| line.trim() == "?") => {
                Err(CanError::Rejected(format!("{} {}", header, data)))
            }
            Ok(reply) => {
                let reply = if reply.is_empty() { "OK".to_string() } else { reply };
                info!("Injected {} {} -> {}", header, data, reply.replace('\n', " | "));
                Ok(reply)
            }
            Err(e) => {
                let err = CanError::from(e);
                if err.is_transport() {
                    warn!("Injection failed: {}", err);
                    self.stop_sniffing();
                }
                Err(err)
            }
        }
    }
}

impl Drop for CanInterface {
    fn drop(&mut self) {
        self.stop_sniffing();
    }
}

/// Deliver one line; returns whether it was decodable
fn emit_line<F: FnMut(String)>(line: &[u8], callback: &mut F) -> bool {
    match std::str::from_utf8(line) {
        Ok(text) => {
            let text = text.trim();
            if text.is_empty() {
                return false;
            }
            callback(text.to_string());
            true
        }
        Err(_) => {
            debug!("Discarding undecodable line ({} bytes)", line.len());
            false
        }
    }
}

fn monitor_bus<F: FnMut(String)>(
    guard: MonitorGuard,
    cancel: &AtomicBool,
    mut callback: F,
    config: &SnifferConfig,
) {
    let link = guard.link().clone();
    let mut buf = [0u8; 256];
    let mut line = Vec::with_capacity(64);
    let mut delivered = 0usize;

    while !cancel.load(Ordering::SeqCst) {
        let read = link.with_port(|port| match port.read(&mut buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(ObdError::from(e)),
        });

        let n = match read {
            Ok(n) => n,
            Err(e) => {
                warn!("Bus monitor lost the adapter: {}", e);
                return;
            }
        };
        if n == 0 {
            std::thread::sleep(IDLE_BACKOFF);
            continue;
        }

        for &byte in &buf[..n] {
            match byte {
                b'\r' | b'\n' => {
                    if emit_line(&line, &mut callback) {
                        delivered += 1;
                    }
                    line.clear();
                }
                elm::PROMPT => line.clear(),
                _ => {
                    line.push(byte);
                    if line.len() > config.max_line_len {
                        debug!("Dropping line over {} bytes", config.max_line_len);
                        line.clear();
                    }
                }
            }
        }
    }

    // Any byte ends monitor mode; drain the STOPPED reply up to the prompt
    let interrupted = link.with_port(|port| {
        port.write_all(b"\r")?;
        port.flush()?;
        elm::read_until_prompt(port, INTERRUPT_TIMEOUT)
    });
    if let Err(e) = interrupted {
        debug!("Leaving monitor mode: {}", e);
    }
    debug!("Bus monitor delivered {} line(s)", delivered);
    drop(guard);
}

/// Sleep in short steps so cancellation stays responsive
fn pause(cancel: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(10);
    let mut remaining = total;
    while !remaining.is_zero() && !cancel.load(Ordering::SeqCst) {
        let nap = remaining.min(step);
        std::thread::sleep(nap);
        remaining -= nap;
    }
}

fn simulate_bus<F: FnMut(String)>(
    guard: MonitorGuard,
    cancel: &AtomicBool,
    mut callback: F,
    config: &SnifferConfig,
) {
    let mut counter: u32 = 0;
    while !cancel.load(Ordering::SeqCst) {
        let id = SIMULATED_IDS[counter as usize % SIMULATED_IDS.len()];
        let a = counter.wrapping_mul(37) as u8;
        let b = counter.wrapping_mul(101) as u8;
        callback(format!(
            "{} 04 {:02X} {:02X} {:02X} 00",
            id, a, b, counter as u8
        ));
        counter = counter.wrapping_add(1);
        pause(cancel, config.simulated_interval());
    }
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::MockAdapter;
    use std::time::Instant;

    const FRAME: &[u8] = b"7E8 03 41 0D 3C";

    fn attached(adapter: &MockAdapter) -> CanInterface {
        let link = Link::new();
        link.attach(Box::new(adapter.clone()), "mock");
        CanInterface::new(
            link,
            SnifferConfig {
                command_timeout_ms: 200,
                ..Default::default()
            },
        )
    }

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl FnMut(String) + Send + 'static) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        (lines, move |line| sink.lock().unwrap().push(line))
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_hardware_disconnect_recovery() {
        let adapter = MockAdapter::vehicle();
        let can = attached(&adapter);
        can.start_sniffing(|_| {}).unwrap();
        assert!(can.is_sniffing());

        adapter.set_fail_writes(true);
        let result = can.inject_frame("7E0", "01 0D");

        let err = result.unwrap_err();
        assert!(err.to_string().starts_with("Error"));
        assert!(err.is_transport());
        assert!(!can.is_sniffing());
        assert_eq!(can.active_workers(), 0);
        assert!(!can.link().is_monitoring());
    }

    #[test]
    fn test_inject_sets_header_and_returns_reply() {
        let adapter = MockAdapter::vehicle();
        let can = attached(&adapter);
        let reply = can.inject_frame("7E0", "1 0D").unwrap();
        assert_eq!(reply, "41 0D 3C");
        assert_eq!(adapter.sent(), vec!["ATSH7E0", "010D"]);
        assert_eq!(can.link().header().as_deref(), Some("7E0"));
    }

    #[test]
    fn test_inject_rejects_bad_input_without_io() {
        let adapter = MockAdapter::vehicle();
        let can = attached(&adapter);
        assert!(matches!(
            can.inject_frame("7E0", "GG"),
            Err(CanError::InvalidHex { .. })
        ));
        assert!(adapter.sent().is_empty());
    }

    #[test]
    fn test_rapid_toggling_keeps_one_worker() {
        let adapter = MockAdapter::vehicle().with_monitor_lines(vec![FRAME.to_vec()]);
        let can = attached(&adapter);

        can.start_sniffing(|_| {}).unwrap();
        can.start_sniffing(|_| {}).unwrap();
        assert_eq!(can.active_workers(), 1);

        can.stop_sniffing();
        can.start_sniffing(|_| {}).unwrap();
        assert!(can.active_workers() <= 1);
        can.stop_sniffing();
        can.start_sniffing(|_| {}).unwrap();
        assert!(can.active_workers() <= 1);
        assert!(can.is_sniffing());
        assert!(adapter.is_monitoring());

        can.stop_sniffing();
        can.stop_sniffing();
        assert_eq!(can.state(), SnifferState::Idle);
        assert_eq!(can.active_workers(), 0);
        assert!(!adapter.is_monitoring());
        assert!(!can.link().is_monitoring());
    }

    #[test]
    fn test_binary_noise_is_discarded() {
        let adapter = MockAdapter::vehicle()
            .with_monitor_lines(vec![FRAME.to_vec(), vec![0x80, 0xFF, 0xFE, 0x00]]);
        let can = attached(&adapter);
        let (lines, callback) = collector();

        can.start_sniffing(callback).unwrap();
        assert!(wait_until(|| lines.lock().unwrap().len() >= 2));
        can.stop_sniffing();

        let lines = lines.lock().unwrap();
        assert!(lines.iter().all(|line| line == "7E8 03 41 0D 3C"));
    }

    #[test]
    fn test_worker_exits_when_link_drops() {
        let adapter = MockAdapter::vehicle();
        let can = attached(&adapter);
        can.start_sniffing(|_| {}).unwrap();

        can.link().detach();
        assert!(wait_until(|| can.active_workers() == 0));
        assert!(!can.is_sniffing());
        assert!(!can.link().is_monitoring());
        can.stop_sniffing();
        assert_eq!(can.state(), SnifferState::Idle);
    }

    #[test]
    fn test_simulated_bus() {
        let link = Link::new();
        link.attach_simulated();
        let can = CanInterface::new(link, SnifferConfig::default());
        let (lines, callback) = collector();

        can.start_sniffing(callback).unwrap();
        assert!(can.link().is_monitoring());
        assert!(wait_until(|| lines.lock().unwrap().len() >= 2));
        can.stop_sniffing();

        assert!(lines.lock().unwrap()[0].starts_with("7E8"));
        assert!(!can.link().is_monitoring());
        assert!(can.inject_frame("7E0", "01 0D").unwrap().contains("simulated"));
    }

    #[test]
    fn test_not_connected() {
        let can = CanInterface::new(Link::new(), SnifferConfig::default());
        assert!(matches!(can.start_sniffing(|_| {}), Err(CanError::NotConnected)));
        assert!(matches!(can.inject_frame("7E0", "01"), Err(CanError::NotConnected)));
        can.stop_sniffing();
        assert!(!can.is_sniffing());
        assert_eq!(can.active_workers(), 0);
    }
}
