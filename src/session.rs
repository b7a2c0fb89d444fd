//! Helper session: process supervisor and command channel.
//!
//! A [`HelperSession`] owns at most one running helper. While running it holds the
//! helper's input stream, its process handle, the [`OutputReader`] task and the
//! [`OutputBuffer`] that task feeds. The four live and die together inside one
//! `Option`, so a session is either fully running or fully stopped.
//!
//! The command channel is not request-tagged. Callers must serialize their requests,
//! which `&mut self` on every I/O method enforces.
//!
//! # Example
//!
//! ```no_run
//! use osci_control::config::Settings;
//! use osci_control::session::HelperSession;
//!
//! # async fn example() -> osci_control::error::AdapterResult<()> {
//! let settings = Settings::load()?;
//! let mut session = HelperSession::from_settings(&settings);
//! session.start().await?;
//! let idn = session
//!     .send_and_get_output(&["q *IDN?"], settings.helper.response_timeout())
//!     .await?;
//! println!("{idn}");
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{AdapterError, AdapterResult};
use crate::helper::{
    ExecutableLauncher, HelperChild, HelperInput, HelperLauncher, OutputBuffer, OutputReader,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Line that tells the helper itself to terminate.
pub const EXIT_COMMAND: &str = "exit";

/// Self-identification query used for health checks.
pub const IDENTIFICATION_QUERY: &str = "q *IDN?";

/// Stand-in deadline distance for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Timing and identification parameters of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Pause after every write before the next read is attempted
    pub settle_delay: Duration,
    /// Sleep between polls of the output buffer
    pub poll_interval: Duration,
    /// Silence that ends a response once its first line arrived
    pub quiet_period: Duration,
    /// Deadline used by [`HelperSession::is_responsive`]
    pub response_timeout: Duration,
    /// Longest a single write may block before it counts as failed
    pub write_timeout: Duration,
    /// Upper bound for each step of the shutdown sequence
    pub shutdown_timeout: Duration,
    /// Expected answer to [`IDENTIFICATION_QUERY`]
    pub identification: String,
}

impl SessionOptions {
    /// Options taken from the `helper` and `instrument` settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let helper = &settings.helper;
        Self {
            settle_delay: helper.settle_delay(),
            poll_interval: helper.poll_interval(),
            quiet_period: helper.quiet_period(),
            response_timeout: helper.response_timeout(),
            write_timeout: helper.write_timeout(),
            shutdown_timeout: helper.shutdown_timeout(),
            identification: settings.instrument.identification.clone(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Everything that exists only while the helper runs.
struct RunningHelper {
    stdin: HelperInput,
    child: Box<dyn HelperChild>,
    reader: OutputReader,
    buffer: OutputBuffer,
}

/// One supervised helper process and the command channel on top of it.
pub struct HelperSession {
    launcher: Arc<dyn HelperLauncher>,
    options: SessionOptions,
    running: Option<RunningHelper>,
}

impl std::fmt::Debug for HelperSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperSession")
            .field("launcher", &self.launcher.describe())
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish()
    }
}

impl HelperSession {
    /// Session that launches helpers through `launcher`. Nothing is started yet.
    pub fn new(launcher: Arc<dyn HelperLauncher>, options: SessionOptions) -> Self {
        Self {
            launcher,
            options,
            running: None,
        }
    }

    /// Session for the executable and timings selected by `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Arc::new(ExecutableLauncher::from_config(&settings.helper)),
            SessionOptions::from_settings(settings),
        )
    }

    /// Timing and identification parameters in use.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// True iff the helper, its reader and its output buffer are all present and the
    /// helper has not closed its output.
    ///
    /// A helper that exited on its own ends the reader at EOF, so it no longer counts
    /// as running. The leftovers are torn down by the next [`start`](Self::start) or
    /// [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.reader.is_finished())
    }

    /// Launch the helper and start draining its output.
    ///
    /// Does nothing if the helper is already running. A helper that has exited on its
    /// own is cleaned up and replaced. A launch failure is returned as-is and never
    /// retried.
    #[instrument(skip(self), fields(launcher = %self.launcher.describe()))]
    pub async fn start(&mut self) -> AdapterResult<()> {
        if self.is_running() {
            debug!("Helper already running");
            return Ok(());
        }
        if self.running.is_some() {
            warn!("Helper exited on its own, cleaning up before relaunch");
            self.stop().await;
        }

        let process = self.launcher.launch()?;
        let (reader, buffer) = OutputReader::spawn(process.stdout, self.options.poll_interval);
        self.running = Some(RunningHelper {
            stdin: process.stdin,
            child: process.child,
            reader,
            buffer,
        });

        info!("Helper session started");
        Ok(())
    }

    /// Shut the helper down. Does nothing if it is not running.
    ///
    /// Sends the exit command, stops and joins the reader, then waits for the process to
    /// exit and kills it if it did not. Every step is bounded by the shutdown timeout,
    /// so a hung helper cannot block this.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            debug!("Helper not running, nothing to stop");
            return;
        };

        let grace = self.options.shutdown_timeout;
        if let Err(e) = write_line_within(&mut running.stdin, EXIT_COMMAND, grace).await {
            debug!(error = %e, "Exit command not delivered");
        }

        if !running.reader.stop(grace).await {
            warn!("Output reader was aborted during shutdown");
        }

        // Closing its input is the cooperative terminate signal for the helper
        drop(running.stdin);
        if !running.child.wait_for_exit(grace).await {
            warn!(pid = ?running.child.id(), "Helper did not exit, killing it");
            if let Err(e) = running.child.kill().await {
                error!(error = %e, "Failed to kill helper");
            }
        }

        info!("Helper session stopped");
    }

    /// Stop followed by start.
    pub async fn restart(&mut self) -> AdapterResult<()> {
        info!("Restarting helper");
        self.stop().await;
        self.start().await
    }

    /// Write `lines` to the helper, newline separated and terminated.
    ///
    /// A failed write restarts the helper and is reported as [`AdapterError::Io`]; the
    /// command is not retried. A failed write of the exit command is not an error.
    pub async fn send<S: AsRef<str>>(&mut self, lines: &[S]) -> AdapterResult<()> {
        self.transmit(lines, false).await
    }

    /// Like [`send`](Self::send), then discard whatever the command produced.
    pub async fn send_and_clear<S: AsRef<str>>(&mut self, lines: &[S]) -> AdapterResult<()> {
        self.transmit(lines, true).await
    }

    async fn transmit<S: AsRef<str>>(&mut self, lines: &[S], clear_after: bool) -> AdapterResult<()> {
        let message = lines
            .iter()
            .map(|line| line.as_ref())
            .collect::<Vec<&str>>()
            .join("\n");

        let written = {
            let running = self.running.as_mut().ok_or(AdapterError::NotRunning)?;
            debug!(command = %message.escape_debug(), "Sending to helper");
            write_line_within(&mut running.stdin, &message, self.options.write_timeout).await
        };

        if let Err(source) = written {
            if message == EXIT_COMMAND {
                debug!(error = %source, "Helper already gone while exiting");
                return Ok(());
            }
            warn!(command = %message.escape_debug(), error = %source, "Write to helper failed");
            if let Err(e) = self.restart().await {
                error!(error = %e, "Helper restart after write failure failed");
            }
            return Err(AdapterError::Io {
                command: message,
                source,
            });
        }

        tokio::time::sleep(self.options.settle_delay).await;

        if clear_after {
            if let Some(running) = self.running.as_mut() {
                running.buffer.clear();
            }
        }
        Ok(())
    }

    /// Drop everything currently buffered. Returns the number of lines discarded.
    pub fn clear_output(&mut self) -> AdapterResult<usize> {
        let running = self.running.as_mut().ok_or(AdapterError::NotRunning)?;
        Ok(running.buffer.clear())
    }

    /// Collect one response from the output buffer.
    ///
    /// Waits up to `timeout` for a first line, then keeps draining until the buffer has
    /// stayed empty for the quiet period. Lines are joined with newlines and the result
    /// is trimmed.
    ///
    /// # Errors
    ///
    /// - [`AdapterError::Timeout`] if nothing arrived by the deadline, or if output was
    ///   still arriving when it passed.
    /// - [`AdapterError::EmptyResponse`] if the response trims to nothing.
    pub async fn get_output(&mut self, timeout: Duration) -> AdapterResult<String> {
        let poll = self.options.poll_interval;
        let quiet = self.options.quiet_period;
        let running = self.running.as_mut().ok_or(AdapterError::NotRunning)?;
        let buffer = &mut running.buffer;

        let deadline = deadline_after(timeout);
        let mut lines: Vec<String> = Vec::new();
        let mut last_line_at: Option<Instant> = None;

        loop {
            let now = Instant::now();
            if let Some(line) = buffer.try_pop() {
                if now >= deadline {
                    debug!(line = %line, "Output still arriving at deadline");
                    return Err(AdapterError::Timeout(timeout));
                }
                lines.push(line);
                last_line_at = Some(now);
                continue;
            }

            let quiet_elapsed = last_line_at.is_some_and(|at| now.duration_since(at) >= quiet);
            if quiet_elapsed || (now >= deadline && !lines.is_empty()) {
                break;
            }
            if now >= deadline {
                return Err(AdapterError::Timeout(timeout));
            }
            if buffer.is_exhausted() {
                // Reader is gone: nothing more will ever arrive
                if lines.is_empty() {
                    return Err(AdapterError::Timeout(timeout));
                }
                break;
            }

            tokio::time::sleep(poll.min(deadline - now)).await;
        }

        let response = lines.join("\n");
        let response = response.trim();
        if response.is_empty() {
            return Err(AdapterError::EmptyResponse);
        }
        Ok(response.to_string())
    }

    /// Send `lines` without clearing, then collect the response.
    pub async fn send_and_get_output<S: AsRef<str>>(
        &mut self,
        lines: &[S],
        timeout: Duration,
    ) -> AdapterResult<String> {
        self.send(lines).await?;
        self.get_output(timeout).await
    }

    /// Whether the instrument answers the identification query with the expected string.
    ///
    /// Stale output is discarded first. No answer or an empty one yields `Ok(false)`;
    /// any other failure is returned.
    pub async fn is_responsive(&mut self) -> AdapterResult<bool> {
        self.clear_output()?;

        let timeout = self.options.response_timeout;
        match self.send_and_get_output(&[IDENTIFICATION_QUERY], timeout).await {
            Ok(answer) if answer == self.options.identification => Ok(true),
            Ok(answer) => {
                warn!(
                    answer = %answer,
                    expected = %self.options.identification,
                    "Unexpected identification"
                );
                Ok(false)
            }
            Err(e) if e.is_no_answer() => {
                debug!(error = %e, "No identification received");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for HelperSession {
    fn drop(&mut self) {
        // Reader cancellation and kill_on_drop take care of the rest
        if self.running.take().is_some() {
            debug!("Helper session dropped while running");
        }
    }
}

/// Instant `timeout` from now, saturating far in the future instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

async fn write_line(stdin: &mut HelperInput, message: &str) -> std::io::Result<()> {
    stdin.write_all(message.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// [`write_line`], failing with `TimedOut` once `bound` has passed.
async fn write_line_within(
    stdin: &mut HelperInput,
    message: &str,
    bound: Duration,
) -> std::io::Result<()> {
    match tokio::time::timeout(bound, write_line(stdin, message)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("helper did not accept input within {bound:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HP_83480A_IDENTIFICATION;
    use crate::helper::MockHelper;

    fn fast_options() -> SessionOptions {
        SessionOptions {
            settle_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(2),
            quiet_period: Duration::from_millis(30),
            response_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_millis(500),
            ..SessionOptions::default()
        }
    }

    fn session_with(helper: &MockHelper) -> HelperSession {
        HelperSession::new(Arc::new(helper.clone()), fast_options())
    }

    #[test]
    fn test_options_follow_settings() {
        let mut settings = Settings::default();
        settings.helper.settle_delay_ms = 250;
        settings.instrument.identification = "ACME,1".to_string();

        let options = SessionOptions::from_settings(&settings);
        assert_eq!(options.settle_delay, Duration::from_millis(250));
        assert_eq!(options.identification, "ACME,1");
    }

    #[tokio::test]
    async fn test_double_start_launches_once() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);

        session.start().await.unwrap();
        session.start().await.unwrap();

        assert!(session.is_running());
        assert_eq!(helper.launch_count(), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);

        session.stop().await;
        assert!(!session.is_running());
        assert_eq!(helper.launch_count(), 0);
        assert!(helper.received_lines().is_empty());
    }

    #[tokio::test]
    async fn test_stop_sends_exit_and_clears_state() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);

        session.start().await.unwrap();
        session.stop().await;

        assert!(!session.is_running());
        assert_eq!(helper.count_received(EXIT_COMMAND), 1);
        assert!(matches!(
            session.send(&["s run"]).await,
            Err(AdapterError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_session_stopped() {
        let helper = MockHelper::new();
        helper.inject_launch_failure();
        let mut session = session_with(&helper);

        assert!(matches!(
            session.start().await,
            Err(AdapterError::Launch { .. })
        ));
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_send_requires_running_session() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);

        assert!(matches!(
            session.send(&["LOGON"]).await,
            Err(AdapterError::NotRunning)
        ));
        assert!(matches!(
            session.get_output(Duration::from_millis(10)).await,
            Err(AdapterError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_send_joins_lines() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        session.send(&["LOGON", "OSCI", "CONNECT 7"]).await.unwrap();
        assert_eq!(helper.received_lines(), vec!["LOGON", "OSCI", "CONNECT 7"]);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_identification_round_trip() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        let answer = session
            .send_and_get_output(&[IDENTIFICATION_QUERY], Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(answer, HP_83480A_IDENTIFICATION);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_multi_line_response_is_joined() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        let data = session
            .send_and_get_output(&["16"], Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(data.lines().count(), crate::helper::mock::MOCK_WAVEFORM.len());
        assert!(data.starts_with("1776\n6441"));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_silence_is_timeout_not_empty_response() {
        let helper = MockHelper::new().silent();
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        let timeout = Duration::from_millis(60);
        let result = session
            .send_and_get_output(&[IDENTIFICATION_QUERY], timeout)
            .await;
        assert!(matches!(result, Err(AdapterError::Timeout(t)) if t == timeout));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_whitespace_response_is_empty_response() {
        let helper = MockHelper::new().with_identification("   ");
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        let result = session
            .send_and_get_output(&[IDENTIFICATION_QUERY], Duration::from_millis(300))
            .await;
        assert!(matches!(result, Err(AdapterError::EmptyResponse)));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_send_and_clear_discards_unsolicited_output() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        helper.push_unsolicited("file written");
        session.send_and_clear(&["s run"]).await.unwrap();

        let answer = session
            .send_and_get_output(&["q :acquire:points?"], Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(answer, "100");
        session.stop().await;
    }

    #[tokio::test]
    async fn test_unsolicited_lines_keep_their_order() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        helper.push_unsolicited("file written");
        let output = session
            .send_and_get_output(&["q :acquire:count?"], Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(output, "200\nfile written");
        session.stop().await;
    }

    #[tokio::test]
    async fn test_is_responsive() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();
        assert!(session.is_responsive().await.unwrap());
        session.stop().await;

        let other = MockHelper::new().with_identification("ACME,SCOPE,1,0");
        let mut session = session_with(&other);
        session.start().await.unwrap();
        assert!(!session.is_responsive().await.unwrap());
        session.stop().await;

        let silent = MockHelper::new().silent();
        let mut session = session_with(&silent);
        session.start().await.unwrap();
        assert!(!session.is_responsive().await.unwrap());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_broken_pipe_restarts_and_reports() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();
        assert!(helper.crash().await);

        let result = session.send(&["s run"]).await;
        match result {
            Err(AdapterError::Io { command, source }) => {
                assert_eq!(command, "s run");
                assert_eq!(source.kind(), std::io::ErrorKind::BrokenPipe);
            }
            other => panic!("expected Io error, got {other:?}"),
        }
        assert_eq!(helper.launch_count(), 2);
        assert!(session.is_running());

        // The restarted helper is usable
        assert!(session.is_responsive().await.unwrap());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_broken_pipe_on_exit_is_not_an_error() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();
        assert!(helper.crash().await);

        session.send(&[EXIT_COMMAND]).await.unwrap();
        assert_eq!(helper.launch_count(), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_restart_launches_new_helper() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        session.restart().await.unwrap();
        assert_eq!(helper.launch_count(), 2);
        assert_eq!(helper.count_received(EXIT_COMMAND), 1);
        assert!(session.is_running());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_exited_helper_is_not_running_and_is_relaunched() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        // The helper leaves on its own; the reader sees EOF
        session.send(&[EXIT_COMMAND]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!session.is_running());

        session.start().await.unwrap();
        assert_eq!(helper.launch_count(), 2);
        assert!(session.is_running());
        assert!(session.is_responsive().await.unwrap());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_blocked_write_restarts_and_stop_stays_bounded() {
        let helper = MockHelper::new().with_latency(Duration::from_secs(120));
        let options = SessionOptions {
            settle_delay: Duration::from_millis(1),
            write_timeout: Duration::from_millis(100),
            shutdown_timeout: Duration::from_millis(200),
            ..fast_options()
        };
        let mut session = HelperSession::new(Arc::new(helper.clone()), options);
        session.start().await.unwrap();

        // The helper stops reading after the first line, so the pipe fills up
        let filler = "x".repeat(1024);
        let started = std::time::Instant::now();
        let source = loop {
            match session.send(&[filler.as_str()]).await {
                Ok(()) => assert!(started.elapsed() < Duration::from_secs(10)),
                Err(AdapterError::Io { source, .. }) => break source,
                Err(other) => panic!("expected Io error, got {other:?}"),
            }
        };
        assert_eq!(source.kind(), std::io::ErrorKind::TimedOut);
        assert_eq!(helper.launch_count(), 2);
        assert!(started.elapsed() < Duration::from_secs(10));

        let stopping = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(5), session.stop())
            .await
            .expect("stop must not hang on a helper that stopped reading");
        assert!(!session.is_running());
        assert!(stopping.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let helper = MockHelper::new();
        let mut session = session_with(&helper);
        session.start().await.unwrap();

        let answer = session
            .send_and_get_output(&[IDENTIFICATION_QUERY], Duration::MAX)
            .await
            .unwrap();
        assert_eq!(answer, HP_83480A_IDENTIFICATION);
        session.stop().await;
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert!(deadline_after(Duration::MAX) > now + Duration::from_secs(60 * 60 * 24 * 365));
        assert!(deadline_after(Duration::ZERO) >= now);
    }
}
