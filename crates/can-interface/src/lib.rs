//! CAN Interface
//!
//! Raw frame injection and background bus sniffing on the same ELM327 link
//! the OBD client uses. Sniffing and polling exclude each other.

mod error;
mod hex;
mod interface;

pub use error::CanError;
pub use hex::{frame_data, frame_header, sanitize_hex};
pub use interface::{CanInterface, SnifferConfig, SnifferState};
