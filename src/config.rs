//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. `config/osci.toml` (base configuration)
//! 2. Environment variables prefixed with `OSCI_`, nested keys separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! OSCI_APPLICATION__LOG_LEVEL=debug
//! OSCI_HELPER__TESTING=true
//! OSCI_HELPER__DIRECTORY=/opt/hpctrl
//! OSCI_PATHS__MEASUREMENT_DIR=/data/measurements
//! ```
//!
//! # Example
//! ```no_run
//! use osci_control::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Helper: {}", settings.helper.executable_path().display());
//! # Ok::<(), osci_control::error::AdapterError>(())
//! ```

use crate::error::{AdapterError, AdapterResult};
use crate::validation;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/osci.toml";

/// Identification string of the HP 83480A the adapter was built for.
pub const HP_83480A_IDENTIFICATION: &str = "HEWLETT-PACKARD,83480A,US35240110,07.12";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Helper process settings
    #[serde(default)]
    pub helper: HelperConfig,
    /// Instrument expectations
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Directories used by the surrounding application
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Oscilloscope Control".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// How to find and drive the hpctrl helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Directory holding the helper subdirectories
    #[serde(default = "default_helper_directory")]
    pub directory: PathBuf,
    /// Executable name, also used as the name of its subdirectory
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Subdirectory of the fake helper used in testing mode
    #[serde(default = "default_fake_directory_name")]
    pub fake_directory_name: String,
    /// Launch the fake helper instead of the real one
    #[serde(default)]
    pub testing: bool,
    /// Pause after every write so the helper can process the command
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Sleep between polls of the output stream and buffer
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Silence after the last received line that ends a response
    #[serde(default = "default_quiet_period")]
    pub quiet_period_ms: u64,
    /// Default deadline for query responses
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Longest a single write to the helper may block before it counts as failed
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Upper bound for joining the reader and waiting for the helper to exit
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            directory: default_helper_directory(),
            executable: default_executable(),
            fake_directory_name: default_fake_directory_name(),
            testing: false,
            settle_delay_ms: default_settle_delay(),
            poll_interval_ms: default_poll_interval(),
            quiet_period_ms: default_quiet_period(),
            response_timeout_ms: default_response_timeout(),
            write_timeout_ms: default_write_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl HelperConfig {
    /// Path of the executable to launch.
    ///
    /// The real helper lives in `<directory>/<executable>/`, the fake one in
    /// `<directory>/<fake_directory_name>/`. Windows builds append `.exe`.
    pub fn executable_path(&self) -> PathBuf {
        let subdirectory = if self.testing {
            &self.fake_directory_name
        } else {
            &self.executable
        };
        self.directory.join(subdirectory).join(format!(
            "{}{}",
            self.executable,
            std::env::consts::EXE_SUFFIX
        ))
    }

    /// Post-write settling delay.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Poll interval for the reader and response drain.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Quiet period ending a multi-line response.
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    /// Default response deadline.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Bound on a single write to the helper.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Shutdown bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// What the adapter expects from the instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Bus address used when none is given explicitly
    #[serde(default = "default_address")]
    pub default_address: u8,
    /// Exact reply to the self-identification query
    #[serde(default = "default_identification")]
    pub identification: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            default_address: default_address(),
            identification: default_identification(),
        }
    }
}

/// Directories the front end stores its files in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Output directory for converted measurements
    #[serde(default = "default_measurement_dir")]
    pub measurement_dir: PathBuf,
    /// Directory of saved instrument configurations
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            measurement_dir: default_measurement_dir(),
            config_dir: default_config_dir(),
        }
    }
}

// Default value functions
fn default_helper_directory() -> PathBuf {
    PathBuf::from("tools")
}

fn default_executable() -> String {
    "hpctrl".to_string()
}

fn default_fake_directory_name() -> String {
    "fake_hpctrl".to_string()
}

fn default_settle_delay() -> u64 {
    100
}

fn default_poll_interval() -> u64 {
    5
}

fn default_quiet_period() -> u64 {
    50
}

fn default_response_timeout() -> u64 {
    5000
}

fn default_write_timeout() -> u64 {
    2000
}

fn default_shutdown_timeout() -> u64 {
    2000
}

fn default_address() -> u8 {
    7
}

fn default_identification() -> String {
    HP_83480A_IDENTIFICATION.to_string()
}

fn default_measurement_dir() -> PathBuf {
    PathBuf::from("assets/measurements")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("assets/config")
}

impl Settings {
    /// Load configuration from `config/osci.toml` and environment variables
    pub fn load() -> AdapterResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AdapterResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("OSCI_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AdapterResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(AdapterError::ConfigValidation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.helper.executable.trim().is_empty() {
            return Err(AdapterError::ConfigValidation(
                "helper.executable cannot be empty".to_string(),
            ));
        }

        if self.helper.poll_interval_ms == 0 {
            return Err(AdapterError::ConfigValidation(
                "helper.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.helper.write_timeout_ms == 0 {
            return Err(AdapterError::ConfigValidation(
                "helper.write_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if validation::bus_address(self.instrument.default_address).is_err() {
            return Err(AdapterError::ConfigValidation(format!(
                "instrument.default_address {} is outside 1-31",
                self.instrument.default_address
            )));
        }

        if self.instrument.identification.trim().is_empty() {
            return Err(AdapterError::ConfigValidation(
                "instrument.identification cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Write these settings as TOML to `path`, creating its directory.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)
    }

    /// Create the measurement, config and helper directories if they are missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.paths.measurement_dir,
            &self.paths.config_dir,
            &self.helper.directory.join(&self.helper.executable),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
