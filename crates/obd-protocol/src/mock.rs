//! Scripted ELM327 stand-in
//!
//! `MockAdapter` implements `Transport` like a serial port: commands
//! written to it are answered from a response table, followed by the `>`
//! prompt. Clones share state, so a test can keep a handle after boxing the
//! adapter into a `Link` and inspect the traffic or inject faults.

use crate::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Delay of an empty read before reporting a timeout
const IDLE_READ: Duration = Duration::from_millis(2);

#[derive(Default)]
struct MockState {
    responses: HashMap<String, String>,
    rx: VecDeque<u8>,
    pending: Vec<u8>,
    sent: Vec<String>,
    fail_writes: bool,
    silent: bool,
    headers: bool,
    monitoring: bool,
    monitor_lines: Vec<Vec<u8>>,
    monitor_pos: usize,
    clears: usize,
}

/// Scripted adapter for tests and demos
#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

fn normalize(command: &str) -> String {
    command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

impl MockAdapter {
    /// Adapter that acknowledges AT commands and answers `NO DATA` otherwise
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter wired to a healthy vehicle on ISO 15765-4 CAN 11/500
    ///
    /// Supports the standard catalog, reports one confirmed (P0301) and one
    /// pending (P0171) code and holds a freeze frame until `04` is sent.
    pub fn vehicle() -> Self {
        Self::new()
            .respond("0100", "41 00 1E 3F 90 03")
            .respond("0120", "41 20 00 02 20 01")
            .respond("0140", "41 40 40 00 00 00")
            .respond("0104", "41 04 66")
            .respond("0105", "41 05 73")
            .respond("0106", "41 06 80")
            .respond("0107", "41 07 82")
            .respond("010B", "41 0B 64")
            .respond("010C", "41 0C 1A F8")
            .respond("010D", "41 0D 3C")
            .respond("010E", "41 0E 90")
            .respond("010F", "41 0F 46")
            .respond("0110", "41 10 04 D2")
            .respond("0111", "41 11 33")
            .respond("0114", "41 14 5A FF")
            .respond("011F", "41 1F 01 2C")
            .respond("012F", "41 2F BF")
            .respond("0133", "41 33 65")
            .respond("0142", "41 42 36 B0")
            .respond("03", "43 01 03 01")
            .respond("07", "47 01 01 71")
            .respond("0A", "4A 00")
            .respond("04", "44")
            .respond("020C00", "42 0C 00 0F A0")
            .respond("020500", "42 05 00 8C")
            .respond("020D00", "42 0D 00 00")
    }

    /// Add or replace the reply to a command
    pub fn respond(self, command: &str, reply: &str) -> Self {
        self.lock()
            .responses
            .insert(normalize(command), reply.to_string());
        self
    }

    /// Never answer anything (simulates an unplugged vehicle side)
    pub fn silent(self) -> Self {
        self.lock().silent = true;
        self
    }

    /// Lines streamed while in monitor mode (`ATMA`), repeated cyclically
    pub fn with_monitor_lines(self, lines: Vec<Vec<u8>>) -> Self {
        self.lock().monitor_lines = lines;
        self
    }

    /// Make every subsequent write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Commands received so far, normalized
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Whether the adapter is currently in monitor mode
    pub fn is_monitoring(&self) -> bool {
        self.lock().monitoring
    }

    /// Number of `04` (clear codes) requests received
    pub fn clear_count(&self) -> usize {
        self.lock().clears
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MockState {
    fn reply_to(&mut self, command: String) {
        self.sent.push(command.clone());
        if self.silent {
            return;
        }

        let reply = match command.as_str() {
            "ATZ" | "ATWS" => "ELM327 v1.5".to_string(),
            "ATDPN" => "A6".to_string(),
            "ATH1" if !self.responses.contains_key("ATH1") => {
                self.headers = true;
                "OK".to_string()
            }
            "ATH0" => {
                self.headers = false;
                "OK".to_string()
            }
            "ATMA" => {
                self.monitoring = true;
                return;
            }
            "04" => {
                self.clears += 1;
                if self.responses.contains_key("04") {
                    self.responses.insert("03".to_string(), "43 00".to_string());
                    self.responses.insert("07".to_string(), "47 00".to_string());
                    self.responses.retain(|k, _| !k.starts_with("02"));
                }
                self.responses
                    .get("04")
                    .cloned()
                    .unwrap_or_else(|| "NO DATA".to_string())
            }
            cmd => match self.responses.get(cmd) {
                Some(reply) => self.render(reply),
                None if cmd.starts_with("AT") => "OK".to_string(),
                None => "NO DATA".to_string(),
            },
        };

        self.rx.extend(reply.as_bytes());
        self.rx.extend(b"\r\r>");
    }

    /// Prefix each line with an ECU header and CAN length byte when headers are on
    fn render(&self, reply: &str) -> String {
        if !self.headers {
            return reply.to_string();
        }
        reply
            .split('\r')
            .map(|line| {
                let len = line.split_whitespace().count();
                if len == 0 || line.contains("NO DATA") {
                    line.to_string()
                } else {
                    format!("7E8 {:02X} {}", len, line)
                }
            })
            .collect::<Vec<_>>()
            .join("\r")
    }
}

impl Write for MockAdapter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Device disconnected",
            ));
        }

        if state.monitoring {
            // Any byte interrupts monitor mode
            state.monitoring = false;
            state.rx.clear();
            state.rx.extend(b"STOPPED\r\r>");
            return Ok(buf.len());
        }

        for &byte in buf {
            if byte == b'\r' {
                let raw = std::mem::take(&mut state.pending);
                let command = normalize(&String::from_utf8_lossy(&raw));
                if !command.is_empty() {
                    state.reply_to(command);
                }
            } else {
                state.pending.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MockAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.lock();
            if !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }

            if state.monitoring && !state.monitor_lines.is_empty() {
                let idx = state.monitor_pos % state.monitor_lines.len();
                state.monitor_pos += 1;
                let mut line = state.monitor_lines[idx].clone();
                line.push(b'\r');
                state.rx.extend(line);
            }
        }

        std::thread::sleep(IDLE_READ);
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Transport for MockAdapter {
    fn pending_input(&mut self) -> io::Result<usize> {
        Ok(self.lock().rx.len())
    }
}
