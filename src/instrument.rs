//! HP 83480A oscilloscope command set.
//!
//! [`Oscilloscope`] composes instrument commands on top of a [`GpibBus`]. Set commands
//! are prefixed with `s `, queries with `q `. Every parameter is validated before any
//! line is written, so a rejected value never touches the helper.
//!
//! Raw waveform text is returned as-is. Turning it into measurement files is left to the
//! caller.

use crate::bus::GpibBus;
use crate::config::Settings;
use crate::error::{AdapterError, AdapterResult};
use crate::session::{deadline_after, HelperSession, IDENTIFICATION_QUERY};
use crate::validation;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Instrument command lines.
pub mod commands {
    /// Restore factory settings
    pub const FACTORY_RESET: &str = "s *RST";
    /// Free-running acquisition
    pub const RUN: &str = "s run";
    /// 16-bit waveform transfer format
    pub const FORMAT_WORD: &str = "s :waveform:format word";
    /// Helper prints the preamble with each continuous read
    pub const PREAMBLE_ON: &str = "pon";
    /// Helper omits the preamble from continuous reads
    pub const PREAMBLE_OFF: &str = "poff";
    /// Helper starts a continuous read
    pub const START_ACQUISITION: &str = "*";
    /// Helper stops a continuous read and writes its file
    pub const STOP_ACQUISITION: &str = "?";
    /// One acquisition, then stop
    pub const SINGLE: &str = "s single";
    /// Ask the instrument to send the selected waveform
    pub const REQUEST_DATA: &str = "s :waveform:data?";
    /// Helper reads a word-format data block and prints one sample per line
    pub const READ_DATA_BLOCK: &str = "16";
    pub const QUERY_PREAMBLE: &str = "q :waveform:preamble?";
    pub const QUERY_POINTS: &str = "q :acquire:points?";
    pub const QUERY_COUNT: &str = "q :acquire:count?";
    pub const QUERY_AVERAGE: &str = "q :acquire:average?";
    pub const AVERAGE_ON: &str = "s :acquire:average on";
    pub const AVERAGE_OFF: &str = "s :acquire:average off";

    /// Record length, `auto` or a number of points.
    pub fn set_points(value: &str) -> String {
        format!("s :acquire:points {value}")
    }

    /// Number of acquisitions averaged.
    pub fn set_count(count: u32) -> String {
        format!("s :acquire:count {count}")
    }

    /// Whether `channel` is displayed.
    pub fn query_display(channel: u8) -> String {
        format!("q :channel{channel}:display?")
    }

    /// Channel read by the next data request.
    pub fn waveform_source(channel: u8) -> String {
        format!("s :waveform:source channel{channel}")
    }

    /// File for continuous reads, sent to the helper outside command mode.
    pub fn output_file(path: &str) -> String {
        format!("file {path}")
    }
}

/// Status line the helper prints once a continuous read has been written to its file.
pub const FILE_WRITTEN_STATUS: &str = "file written";

/// Record length setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionPoints {
    /// Let the instrument choose
    Auto,
    /// Fixed number of points (16..=4096)
    Fixed(u32),
}

impl fmt::Display for AcquisitionPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionPoints::Auto => write!(f, "auto"),
            AcquisitionPoints::Fixed(points) => write!(f, "{points}"),
        }
    }
}

/// One channel captured by [`Oscilloscope::single`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformCapture {
    /// Channel number, 1..=4
    pub channel: u8,
    /// Waveform preamble as reported after the read
    pub preamble: String,
    /// Data block, one sample per line
    pub data: String,
}

impl WaveformCapture {
    /// Samples of the data block that parse as integers.
    pub fn samples(&self) -> Vec<i64> {
        self.data
            .split_whitespace()
            .filter_map(|sample| sample.parse().ok())
            .collect()
    }
}

/// Channel digit string understood by the helper, e.g. `[1, 3]` becomes `"13"`.
pub fn channel_digits(channels: &[u8]) -> AdapterResult<String> {
    channels
        .iter()
        .map(|&channel| validation::channel(channel).map(|c| c.to_string()))
        .collect()
}

/// Oscilloscope driver on top of a bus session.
#[derive(Debug)]
pub struct Oscilloscope {
    bus: GpibBus,
    response_timeout: Duration,
}

impl Oscilloscope {
    /// Driver over `bus`, answering queries within `response_timeout`.
    pub fn new(bus: GpibBus, response_timeout: Duration) -> Self {
        Self {
            bus,
            response_timeout,
        }
    }

    /// Driver for the helper and timings selected by `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            GpibBus::new(HelperSession::from_settings(settings)),
            settings.helper.response_timeout(),
        )
    }

    /// Underlying bus.
    pub fn bus(&self) -> &GpibBus {
        &self.bus
    }

    /// Underlying bus, for raw bus-level commands.
    pub fn bus_mut(&mut self) -> &mut GpibBus {
        &mut self.bus
    }

    /// Deadline applied to every query.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Start the helper.
    pub async fn start(&mut self) -> AdapterResult<()> {
        self.bus.start().await
    }

    /// Disconnect and stop the helper.
    pub async fn shutdown(&mut self) {
        self.bus.shutdown().await;
    }

    /// Connect to `address`, enter command mode and apply the working defaults:
    /// word waveform format, run mode, preamble output off.
    #[instrument(skip(self))]
    pub async fn initialize(&mut self, address: u8) -> AdapterResult<()> {
        self.bus.connect(address).await?;
        self.bus.enter_command_mode().await?;
        self.set_word_format().await?;
        self.run().await?;
        self.preamble_off().await?;
        info!(address, "Oscilloscope initialized");
        Ok(())
    }

    async fn set(&mut self, line: &str) -> AdapterResult<()> {
        self.bus.send(&[line]).await
    }

    async fn query(&mut self, line: &str) -> AdapterResult<String> {
        let timeout = self.response_timeout;
        self.bus.send_and_get_output(&[line], timeout).await
    }

    async fn query_number(&mut self, line: &str) -> AdapterResult<u32> {
        let response = self.query(line).await?;
        parse_number(&response).ok_or_else(|| AdapterError::UnexpectedResponse {
            query: line.to_string(),
            response,
        })
    }

    async fn query_flag(&mut self, line: &str) -> AdapterResult<bool> {
        let response = self.query(line).await?;
        parse_flag(&response).ok_or_else(|| AdapterError::UnexpectedResponse {
            query: line.to_string(),
            response,
        })
    }

    /// Identification string reported by the instrument.
    pub async fn identify(&mut self) -> AdapterResult<String> {
        self.query(IDENTIFICATION_QUERY).await
    }

    /// Record length. Fixed values must lie in 16..=4096.
    pub async fn set_points(&mut self, points: AcquisitionPoints) -> AdapterResult<()> {
        if let AcquisitionPoints::Fixed(points) = points {
            validation::acquisition_points(points)?;
        }
        self.set(&commands::set_points(&points.to_string())).await
    }

    /// Current record length.
    pub async fn points(&mut self) -> AdapterResult<u32> {
        self.query_number(commands::QUERY_POINTS).await
    }

    /// Number of acquisitions averaged, 1..=4096.
    pub async fn set_average_count(&mut self, count: u32) -> AdapterResult<()> {
        let count = validation::average_count(count)?;
        self.set(&commands::set_count(count)).await
    }

    /// Current averaging count.
    pub async fn average_count(&mut self) -> AdapterResult<u32> {
        self.query_number(commands::QUERY_COUNT).await
    }

    /// Turn averaging on or off.
    pub async fn set_averaging(&mut self, enabled: bool) -> AdapterResult<()> {
        let line = if enabled {
            commands::AVERAGE_ON
        } else {
            commands::AVERAGE_OFF
        };
        self.set(line).await
    }

    /// Whether averaging is on.
    pub async fn averaging(&mut self) -> AdapterResult<bool> {
        self.query_flag(commands::QUERY_AVERAGE).await
    }

    /// Whether `channel` (1..=4) is displayed.
    pub async fn channel_displayed(&mut self, channel: u8) -> AdapterResult<bool> {
        let channel = validation::channel(channel)?;
        self.query_flag(&commands::query_display(channel)).await
    }

    /// Every displayed channel, in ascending order.
    pub async fn displayed_channels(&mut self) -> AdapterResult<Vec<u8>> {
        let mut displayed = Vec::new();
        for channel in validation::CHANNEL_RANGE {
            if self.channel_displayed(channel).await? {
                displayed.push(channel);
            }
        }
        Ok(displayed)
    }

    /// Preamble of the selected waveform source.
    pub async fn preamble(&mut self) -> AdapterResult<String> {
        self.query(commands::QUERY_PREAMBLE).await
    }

    /// Restore factory settings.
    pub async fn factory_reset(&mut self) -> AdapterResult<()> {
        self.set(commands::FACTORY_RESET).await
    }

    /// Switch to free-running acquisition.
    pub async fn run(&mut self) -> AdapterResult<()> {
        self.set(commands::RUN).await
    }

    /// Select the 16-bit waveform transfer format.
    pub async fn set_word_format(&mut self) -> AdapterResult<()> {
        self.set(commands::FORMAT_WORD).await
    }

    /// Include the preamble in continuous reads.
    pub async fn preamble_on(&mut self) -> AdapterResult<()> {
        self.set(commands::PREAMBLE_ON).await
    }

    /// Leave the preamble out of continuous reads.
    pub async fn preamble_off(&mut self) -> AdapterResult<()> {
        self.set(commands::PREAMBLE_OFF).await
    }

    /// Start a continuous read with the current file and channels.
    pub async fn start_acquisition(&mut self) -> AdapterResult<()> {
        self.set(commands::START_ACQUISITION).await
    }

    /// Stop a continuous read.
    pub async fn stop_acquisition(&mut self) -> AdapterResult<()> {
        self.set(commands::STOP_ACQUISITION).await
    }

    /// File the helper writes continuous reads to. Must be sent outside command mode.
    pub async fn set_output_file(&mut self, path: &str) -> AdapterResult<()> {
        let path = validation::output_path(path)?;
        self.set(&commands::output_file(path)).await
    }

    /// Start a continuous read of `channels` into `path`.
    ///
    /// Leaves command mode to set the file, re-enters it, selects the channels and
    /// starts acquisition.
    #[instrument(skip(self))]
    pub async fn start_run(&mut self, path: &str, channels: &[u8]) -> AdapterResult<()> {
        let path = validation::output_path(path)?;
        let digits = channel_digits(channels)?;
        if digits.is_empty() {
            return Err(AdapterError::InvalidValue {
                parameter: "channel selection",
                value: String::new(),
            });
        }

        self.bus.exit_command_mode().await?;
        self.set(&commands::output_file(path)).await?;
        self.bus.enter_command_mode().await?;
        self.set(&digits).await?;
        self.start_acquisition().await?;
        info!(path, channels = %digits, "Continuous read started");
        Ok(())
    }

    /// Stop a continuous read, wait up to `timeout` for the helper to report the file
    /// written, then return the preamble.
    #[instrument(skip(self))]
    pub async fn stop_run(&mut self, timeout: Duration) -> AdapterResult<String> {
        self.stop_acquisition().await?;
        self.wait_for_status(FILE_WRITTEN_STATUS, timeout).await?;
        self.preamble().await
    }

    /// Take one acquisition and read back each of `channels`.
    #[instrument(skip(self))]
    pub async fn single(&mut self, channels: &[u8]) -> AdapterResult<Vec<WaveformCapture>> {
        for &channel in channels {
            validation::channel(channel)?;
        }

        self.set(commands::SINGLE).await?;
        let mut captures = Vec::with_capacity(channels.len());
        for &channel in channels {
            self.set(&commands::waveform_source(channel)).await?;
            self.set(commands::REQUEST_DATA).await?;
            let data = self.query(commands::READ_DATA_BLOCK).await?;
            let preamble = self.preamble().await?;
            debug!(channel, samples = data.lines().count(), "Waveform captured");
            captures.push(WaveformCapture {
                channel,
                preamble,
                data,
            });
        }
        Ok(captures)
    }

    /// Poll the output until a line containing `status` shows up. Returns that line.
    ///
    /// Lines that do not match are discarded.
    pub async fn wait_for_status(&mut self, status: &str, timeout: Duration) -> AdapterResult<String> {
        let deadline = deadline_after(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AdapterError::Timeout(timeout));
            }
            match self.bus.get_output(remaining).await {
                Ok(output) => {
                    if let Some(line) = output.lines().find(|line| line.contains(status)) {
                        return Ok(line.trim().to_string());
                    }
                    debug!(output = %output, "Skipping unrelated helper output");
                }
                Err(e) if e.is_no_answer() => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a raw line without waiting for an answer.
    pub async fn custom(&mut self, line: &str) -> AdapterResult<()> {
        self.set(line).await
    }

    /// Send a raw line and return the answer.
    pub async fn custom_query(&mut self, line: &str, timeout: Duration) -> AdapterResult<String> {
        self.bus.send_and_get_output(&[line], timeout).await
    }
}

fn parse_number(response: &str) -> Option<u32> {
    let text = response.trim();
    text.parse::<u32>()
        .ok()
        // The instrument may answer in scientific notation
        .or_else(|| {
            text.parse::<f64>()
                .ok()
                .filter(|value| value.is_finite() && *value >= 0.0 && value.fract() == 0.0)
                .map(|value| value as u32)
        })
}

fn parse_flag(response: &str) -> Option<bool> {
    match response.trim().to_ascii_lowercase().as_str() {
        "1" | "on" => Some(true),
        "0" | "off" => Some(false),
        _ => None,
    }
}
