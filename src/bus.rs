//! Bus connection and command-mode state machine.
//!
//! ```text
//! Disconnected --connect(a)--> Connected{a} --enter_command_mode--> CommandMode{a}
//!      ^                            |  ^                                  |
//!      +--------disconnect----------+  +--------exit_command_mode---------+
//! ```
//!
//! Transition rules:
//! - A request whose target state already holds is an `Ok(())` no-op and sends nothing.
//! - A request that the current state cannot reach fails with [`AdapterError::State`]:
//!   connecting to a second address, or entering command mode while disconnected.
//! - `disconnect` from command mode leaves command mode first.
//! - A write failure restarts the helper, which drops the bus session, so the state falls
//!   back to `Disconnected`.

use crate::error::{AdapterError, AdapterResult};
use crate::session::HelperSession;
use crate::validation;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Control lines understood by the helper.
pub mod protocol {
    /// Log on to the bus adapter
    pub const LOGON: &str = "LOGON";
    /// Select the oscilloscope protocol
    pub const OSCI: &str = "OSCI";
    /// Drop bus addressing
    pub const DISCONNECT: &str = "DISCONNECT";
    /// Enter command mode
    pub const ENTER_COMMAND_MODE: &str = "CMD";
    /// Leave command mode
    pub const EXIT_COMMAND_MODE: &str = ".";

    /// Address the instrument at `address`.
    pub fn connect(address: u8) -> String {
        format!("CONNECT {address}")
    }
}

/// Logical state of the bus session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusState {
    /// No instrument addressed
    #[default]
    Disconnected,
    /// Instrument addressed, helper still reads its own commands
    Connected { address: u8 },
    /// Lines go straight to the instrument
    CommandMode { address: u8 },
}

impl BusState {
    /// True in both connected states.
    pub fn is_connected(&self) -> bool {
        !matches!(self, BusState::Disconnected)
    }

    /// True only in command mode.
    pub fn in_command_mode(&self) -> bool {
        matches!(self, BusState::CommandMode { .. })
    }

    /// Address of the connected instrument. `None` while disconnected.
    pub fn address(&self) -> Option<u8> {
        match *self {
            BusState::Disconnected => None,
            BusState::Connected { address } | BusState::CommandMode { address } => Some(address),
        }
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusState::Disconnected => write!(f, "disconnected"),
            BusState::Connected { address } => write!(f, "connected to {address}"),
            BusState::CommandMode { address } => {
                write!(f, "connected to {address} in command mode")
            }
        }
    }
}

/// A helper session together with the bus state it implies.
///
/// All traffic goes through this type so that a helper restart can never leave a stale
/// bus state behind.
#[derive(Debug)]
pub struct GpibBus {
    session: HelperSession,
    state: BusState,
}

impl GpibBus {
    /// Bus over `session`, starting disconnected.
    pub fn new(session: HelperSession) -> Self {
        Self {
            session,
            state: BusState::Disconnected,
        }
    }

    /// Underlying helper session.
    pub fn session(&self) -> &HelperSession {
        &self.session
    }

    /// Current bus state.
    pub fn state(&self) -> BusState {
        self.state
    }

    /// Whether an instrument is addressed.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Whether lines go straight to the instrument.
    pub fn in_command_mode(&self) -> bool {
        self.state.in_command_mode()
    }

    /// Address of the connected instrument.
    pub fn address(&self) -> Option<u8> {
        self.state.address()
    }

    /// Whether the helper is running.
    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    /// Start the helper. A fresh helper has no bus session.
    pub async fn start(&mut self) -> AdapterResult<()> {
        let was_running = self.session.is_running();
        self.session.start().await?;
        if !was_running {
            self.state = BusState::Disconnected;
        }
        Ok(())
    }

    /// Stop the helper without talking to the bus first.
    pub async fn stop(&mut self) {
        self.session.stop().await;
        self.state = BusState::Disconnected;
    }

    /// Restart the helper. The bus session is lost.
    pub async fn restart(&mut self) -> AdapterResult<()> {
        self.state = BusState::Disconnected;
        self.session.restart().await
    }

    /// Disconnect if needed, then stop the helper. Errors are logged, not returned.
    pub async fn shutdown(&mut self) {
        if self.session.is_running() {
            if let Err(e) = self.disconnect().await {
                warn!(error = %e, "Disconnect during shutdown failed");
            }
        }
        self.stop().await;
    }

    /// Address the instrument at `address` and verify it identifies itself.
    ///
    /// # Errors
    ///
    /// - [`AdapterError::InvalidAddress`] outside 1..=31, before any I/O.
    /// - [`AdapterError::State`] if already connected to a different address.
    /// - [`AdapterError::Connect`] if the instrument does not answer the identification
    ///   query. Addressing is undone and the state stays `Disconnected`.
    pub async fn connect(&mut self, address: u8) -> AdapterResult<()> {
        let address = validation::bus_address(address)?;

        match self.state.address() {
            Some(current) if current == address => {
                debug!(address, "Already connected");
                return Ok(());
            }
            Some(current) => {
                return Err(AdapterError::State(format!(
                    "already connected to address {current}, disconnect before connecting to {address}"
                )));
            }
            None => {}
        }

        let connect = protocol::connect(address);
        self.send(&[protocol::LOGON, protocol::OSCI, connect.as_str()])
            .await?;

        match self.session.is_responsive().await {
            Ok(true) => {
                self.state = BusState::Connected { address };
                info!(address, "Connected to instrument");
                Ok(())
            }
            Ok(false) => {
                warn!(address, "Instrument did not identify itself, undoing connect");
                self.undo_connect().await;
                Err(AdapterError::Connect(address))
            }
            Err(e) => {
                if !e.triggers_restart() {
                    self.undo_connect().await;
                }
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    async fn undo_connect(&mut self) {
        if let Err(e) = self.session.send(&[protocol::DISCONNECT]).await {
            warn!(error = %e, "Failed to undo bus addressing");
        }
        self.state = BusState::Disconnected;
    }

    /// Drop bus addressing, leaving command mode first. No-op while disconnected.
    pub async fn disconnect(&mut self) -> AdapterResult<()> {
        let Some(address) = self.state.address() else {
            debug!("Already disconnected");
            return Ok(());
        };

        self.exit_command_mode().await?;
        self.send(&[protocol::DISCONNECT]).await?;
        self.state = BusState::Disconnected;
        info!(address, "Disconnected from instrument");
        Ok(())
    }

    /// Enter command mode. No-op if already there.
    pub async fn enter_command_mode(&mut self) -> AdapterResult<()> {
        match self.state {
            BusState::Disconnected => Err(AdapterError::State(
                "cannot enter command mode while disconnected".to_string(),
            )),
            BusState::CommandMode { .. } => {
                debug!("Already in command mode");
                Ok(())
            }
            BusState::Connected { address } => {
                self.send(&[protocol::ENTER_COMMAND_MODE]).await?;
                self.state = BusState::CommandMode { address };
                debug!(address, "Entered command mode");
                Ok(())
            }
        }
    }

    /// Leave command mode. No-op if not in it.
    pub async fn exit_command_mode(&mut self) -> AdapterResult<()> {
        match self.state {
            BusState::CommandMode { address } => {
                self.send(&[protocol::EXIT_COMMAND_MODE]).await?;
                self.state = BusState::Connected { address };
                debug!(address, "Left command mode");
                Ok(())
            }
            _ => {
                debug!(state = %self.state, "Not in command mode");
                Ok(())
            }
        }
    }

    /// See [`HelperSession::send`].
    pub async fn send<S: AsRef<str>>(&mut self, lines: &[S]) -> AdapterResult<()> {
        let result = self.session.send(lines).await;
        self.track(result)
    }

    /// See [`HelperSession::send_and_clear`].
    pub async fn send_and_clear<S: AsRef<str>>(&mut self, lines: &[S]) -> AdapterResult<()> {
        let result = self.session.send_and_clear(lines).await;
        self.track(result)
    }

    /// See [`HelperSession::get_output`].
    pub async fn get_output(&mut self, timeout: Duration) -> AdapterResult<String> {
        self.session.get_output(timeout).await
    }

    /// See [`HelperSession::send_and_get_output`].
    pub async fn send_and_get_output<S: AsRef<str>>(
        &mut self,
        lines: &[S],
        timeout: Duration,
    ) -> AdapterResult<String> {
        let result = self.session.send_and_get_output(lines, timeout).await;
        self.track(result)
    }

    /// See [`HelperSession::clear_output`].
    pub fn clear_output(&mut self) -> AdapterResult<usize> {
        self.session.clear_output()
    }

    /// See [`HelperSession::is_responsive`].
    pub async fn is_responsive(&mut self) -> AdapterResult<bool> {
        let result = self.session.is_responsive().await;
        self.track(result)
    }

    fn track<T>(&mut self, result: AdapterResult<T>) -> AdapterResult<T> {
        if let Err(e) = &result {
            self.note_failure(e);
        }
        result
    }

    fn note_failure(&mut self, error: &AdapterError) {
        if error.triggers_restart() && self.state.is_connected() {
            warn!(state = %self.state, "Helper restarted, bus session lost");
            self.state = BusState::Disconnected;
        }
    }
}
