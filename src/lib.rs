//! # Oscilloscope Control Library
//!
//! This crate drives an HP 83480A digital oscilloscope over a GPIB bus. The bus is reached
//! through `hpctrl`, an external helper that speaks a line protocol on its standard
//! streams. The library supervises that helper and turns its unframed output back into
//! request/response pairs.
//!
//! ## Crate Structure
//!
//! Leaf-first:
//!
//! - **`helper`**: Launching the helper (`ExecutableLauncher`, `MockHelper`) and the
//!   background `OutputReader` that drains its output into an `OutputBuffer`.
//! - **`session`**: `HelperSession`, the process supervisor plus the command channel
//!   (`send`, `get_output`, `send_and_get_output`, `is_responsive`).
//! - **`bus`**: `GpibBus`, the connection and command-mode state machine.
//! - **`instrument`**: `Oscilloscope`, the instrument command set.
//! - **`terminal`**: Classification of operator lines for the terminal binary.
//! - **`config`**: Figment-based settings (`config/osci.toml` plus `OSCI_` environment).
//! - **`error`**: The `AdapterError` enum shared by every layer.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`validation`**: Range checks run before any I/O.

pub mod bus;
pub mod config;
pub mod error;
pub mod helper;
pub mod instrument;
pub mod logging;
pub mod session;
pub mod terminal;
pub mod validation;

pub use bus::{BusState, GpibBus};
pub use error::{AdapterError, AdapterResult};
pub use instrument::{AcquisitionPoints, Oscilloscope, WaveformCapture};
pub use session::{HelperSession, SessionOptions};
