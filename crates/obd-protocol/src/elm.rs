//! ELM327 command framing and response parsing
//!
//! Commands are ASCII terminated by `\r`; the adapter answers with one or
//! more lines and then prints the `>` prompt.

use crate::error::ObdError;
use crate::transport::Transport;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

/// Prompt byte the adapter prints when ready for the next command
pub const PROMPT: u8 = b'>';

/// Replies that mean the adapter could not talk to the vehicle
const ERROR_REPLIES: &[&str] = &[
    "?",
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS ERROR",
    "BUS BUSY",
    "FB ERROR",
    "DATA ERROR",
    "BUFFER FULL",
    "STOPPED",
    "ERROR",
];

/// Upper bound on reads spent discarding stale input before a command
const MAX_DISCARD_READS: usize = 64;

/// Send one command and collect the reply up to the prompt
///
/// Input left over from an earlier exchange (a reply that arrived after its
/// deadline) is discarded first.
pub fn send_command(
    port: &mut dyn Transport,
    command: &str,
    timeout: Duration,
) -> Result<String, ObdError> {
    discard_input(port)?;
    debug!("-> {}", command);
    port.write_all(format!("{}\r", command).as_bytes())?;
    port.flush()?;
    let reply = read_until_prompt(port, timeout)?;
    let cleaned = clean_reply(&reply, command);
    debug!("<- {}", cleaned.replace('\n', " | "));
    Ok(cleaned)
}

fn is_idle(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Drop everything already received; returns the number of bytes dropped
pub fn discard_input(port: &mut dyn Transport) -> Result<usize, ObdError> {
    let mut buf = [0u8; 256];
    let mut discarded = 0;

    for _ in 0..MAX_DISCARD_READS {
        let pending = port.pending_input()?;
        if pending == 0 {
            break;
        }
        let len = pending.min(buf.len());
        match port.read(&mut buf[..len]) {
            Ok(0) => break,
            Ok(n) => discarded += n,
            Err(e) if is_idle(e.kind()) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if discarded > 0 {
        debug!("Discarded {} stale byte(s)", discarded);
    }
    Ok(discarded)
}

/// Read raw bytes until the prompt or until the deadline passes
///
/// When more output follows a prompt, the earlier reply is stale and the
/// read continues to the next prompt; the newest complete reply wins.
pub fn read_until_prompt(port: &mut dyn Transport, timeout: Duration) -> Result<String, ObdError> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 256];
    let mut current = Vec::new();
    let mut complete: Option<Vec<u8>> = None;

    loop {
        match port.read(&mut buf) {
            Ok(0) => std::thread::sleep(Duration::from_millis(1)),
            Ok(n) => {
                for &byte in &buf[..n] {
                    if byte == PROMPT {
                        if let Some(stale) = complete.replace(std::mem::take(&mut current)) {
                            debug!("Superseded reply: {}", String::from_utf8_lossy(&stale).trim());
                        }
                    } else {
                        current.push(byte);
                    }
                }
                let trailing_noise = current.iter().all(|b| b.is_ascii_whitespace() || *b == 0);
                if complete.is_some() && trailing_noise {
                    break;
                }
            }
            Err(e) if is_idle(e.kind()) => {}
            Err(e) => return Err(e.into()),
        }

        if Instant::now() >= deadline {
            if complete.is_some() {
                break;
            }
            return Err(ObdError::Timeout(timeout.as_millis() as u64));
        }
    }

    let reply = complete.unwrap_or_default();
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

/// Normalize line endings, drop the command echo and status chatter
pub(crate) fn clean_reply(raw: &str, command: &str) -> String {
    raw.split(['\r', '\n'])
        .map(|line| line.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
        .filter(|line| !line.is_empty())
        .filter(|line| !line.eq_ignore_ascii_case(command))
        .filter(|line| !line.starts_with("SEARCHING") && !line.starts_with("BUS INIT"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fail if the reply is one of the adapter's error messages
pub fn check_reply(reply: &str, request: &str) -> Result<(), ObdError> {
    if reply.lines().any(|line| line.trim() == "NO DATA") {
        return Err(ObdError::NoData(request.to_string()));
    }
    if let Some(line) = reply
        .lines()
        .map(str::trim)
        .find(|line| ERROR_REPLIES.iter().any(|e| line.starts_with(e)))
    {
        return Err(ObdError::InvalidResponse(format!("{}: {}", request, line)));
    }
    if reply.trim().is_empty() {
        return Err(ObdError::InvalidResponse(format!("{}: empty reply", request)));
    }
    Ok(())
}

/// Decode a run of hex digits, ignoring whitespace
pub fn decode_hex(text: &str) -> Result<Vec<u8>, ObdError> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ObdError::InvalidResponse(format!("not hex: '{}'", text)));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| ObdError::InvalidResponse(e.to_string()))
        })
        .collect()
}

/// Leading bytes of a positive response: service + 0x40, then the request echo
pub fn positive_prefix(request: &[u8]) -> Result<Vec<u8>, ObdError> {
    let (service, rest) = request
        .split_first()
        .ok_or_else(|| ObdError::InvalidResponse("empty request".to_string()))?;
    let mut prefix = Vec::with_capacity(request.len());
    prefix.push(service.wrapping_add(0x40));
    prefix.extend_from_slice(rest);
    Ok(prefix)
}

/// Split a multi-frame line of the form `0: 49 02 01` into its payload
fn frame_segment(line: &str) -> Option<&str> {
    let (index, rest) = line.split_once(':')?;
    if !index.is_empty() && index.trim().chars().all(|c| c.is_ascii_hexdigit()) {
        Some(rest)
    } else {
        None
    }
}

/// Extract the data bytes that follow the positive-response prefix
///
/// Handles single-line replies, replies from several ECUs (first matching
/// line wins) and ISO-TP multi-frame replies (`0:`, `1:` … segments).
pub fn extract_payload(reply: &str, request: &[u8]) -> Result<Vec<u8>, ObdError> {
    extract_payloads(reply, request)?
        .into_iter()
        .next()
        .ok_or_else(|| ObdError::InvalidResponse(format!("no positive response in '{}'", reply)))
}

/// Every positive-response payload in a headerless reply, in line order
///
/// One entry per answering ECU; an ISO-TP multi-frame message counts as
/// one entry and comes first.
pub fn extract_payloads(reply: &str, request: &[u8]) -> Result<Vec<Vec<u8>>, ObdError> {
    let prefix = positive_prefix(request)?;
    let mut assembled = Vec::new();
    let mut candidates = Vec::new();

    for line in reply.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(segment) = frame_segment(line) {
            assembled.extend(decode_hex(segment)?);
            continue;
        }
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() == 3 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
            // ISO-TP byte count preceding the segments
            continue;
        }
        candidates.push(decode_hex(line)?);
    }
    if !assembled.is_empty() {
        candidates.insert(0, assembled);
    }

    Ok(candidates
        .iter()
        .filter_map(|bytes| bytes.strip_prefix(prefix.as_slice()))
        .map(<[u8]>::to_vec)
        .collect())
}

/// Whether a headerless reply is a positive response to some other request
///
/// Such a reply was produced for an exchange that already gave up, so the
/// answer to `request` is still on its way.
pub fn answers_other_request(reply: &str, request: &[u8]) -> bool {
    let Ok(prefix) = positive_prefix(request) else {
        return false;
    };
    let mut lines = reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(decode_hex)
        .peekable();
    if lines.peek().is_none() {
        return false;
    }
    lines.all(|bytes| match bytes {
        Ok(bytes) => match bytes.first() {
            Some(&service) => (0x41..0x7F).contains(&service) && !bytes.starts_with(&prefix),
            None => false,
        },
        Err(_) => false,
    })
}

/// Decode a supported-PID bitmap (reply to `0100`, `0120`, …)
///
/// Bit 31 of the four bytes is PID `base + 1`, bit 0 is `base + 32`.
pub fn decode_supported(base: u8, bitmap: &[u8]) -> Vec<u8> {
    bitmap
        .iter()
        .take(4)
        .enumerate()
        .flat_map(|(byte_idx, byte)| {
            (0..8u8).filter_map(move |bit| {
                if byte & (0x80 >> bit) != 0 {
                    Some(base + (byte_idx as u8) * 8 + bit + 1)
                } else {
                    None
                }
            })
        })
        .collect()
}
