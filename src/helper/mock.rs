//! Mock helper for testing
//!
//! An in-memory stand-in for the `hpctrl` helper that speaks the same line protocol
//! over `tokio::io::duplex` pipes. It provides:
//! - Canned instrument state (acquisition points, averaging, channel display)
//! - Launch counting and a log of every received line for test verification
//! - Failure injection: launch failure, crash (pipes dropped), silent identification,
//!   unsolicited output lines
//!
//! # Example
//!
//! ```
//! use osci_control::helper::{HelperLauncher, MockHelper};
//!
//! let helper = MockHelper::new();
//! assert_eq!(helper.launch_count(), 0);
//! assert!(helper.describe().contains("mock"));
//! ```

use super::{HelperChild, HelperLauncher, HelperProcess};
use crate::config::HP_83480A_IDENTIFICATION;
use crate::error::{AdapterError, AdapterResult};
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Preamble returned for `q :waveform:preamble?`.
pub const MOCK_PREAMBLE: &str = "2,2,2000,50,5.000000E-12,2.2000000000E-08,0,1.32375E-06,1.33434E-03,0,2,1.00000E-08,2.2000000000E-08,8.00000E-02,0.0E+000,\"10 DEC 2021\",\"14:16:16:16\",\"83480A:US35240110\",\"83485A:US34430174\",2,100,2,1,2.00000E+10,0E+000";

/// Waveform block returned for the `16` data request, one sample per line.
pub const MOCK_WAVEFORM: [&str; 13] = [
    "1776", "6441", "8921", "12026", "16171", "18826", "20363", "20797", "19499", "17190",
    "32256", "31744", "31232",
];

/// Status line emitted when a continuous read is stopped with an output file set.
pub const MOCK_FILE_WRITTEN: &str = "file written";

const PIPE_CAPACITY: usize = 64 * 1024;

type CrashSignal = oneshot::Sender<oneshot::Sender<()>>;

/// In-memory helper implementing [`HelperLauncher`].
///
/// Clones share state, so a test can keep one handle while the session owns another.
#[derive(Clone)]
pub struct MockHelper {
    inner: Arc<MockInner>,
}

struct MockInner {
    launches: AtomicUsize,
    fail_next_launch: AtomicBool,
    identification: Mutex<Option<String>>,
    latency: Mutex<Duration>,
    received: Mutex<Vec<String>>,
    unsolicited: Mutex<VecDeque<String>>,
    crash: Mutex<Option<CrashSignal>>,
}

impl Default for MockHelper {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockHelper {
    /// Mock helper answering like an HP 83480A.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                launches: AtomicUsize::new(0),
                fail_next_launch: AtomicBool::new(false),
                identification: Mutex::new(Some(HP_83480A_IDENTIFICATION.to_string())),
                latency: Mutex::new(Duration::ZERO),
                received: Mutex::new(Vec::new()),
                unsolicited: Mutex::new(VecDeque::new()),
                crash: Mutex::new(None),
            }),
        }
    }

    /// Answer the identification query with `identification` instead.
    pub fn with_identification(self, identification: &str) -> Self {
        *lock(&self.inner.identification) = Some(identification.to_string());
        self
    }

    /// Never answer the identification query, as when no instrument is on the bus.
    pub fn silent(self) -> Self {
        *lock(&self.inner.identification) = None;
        self
    }

    /// Delay before each command is processed.
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.inner.latency) = latency;
        self
    }

    /// Number of times the helper was launched.
    pub fn launch_count(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// Every line received so far, across all launches.
    pub fn received_lines(&self) -> Vec<String> {
        lock(&self.inner.received).clone()
    }

    /// How often exactly `line` was received.
    pub fn count_received(&self, line: &str) -> usize {
        lock(&self.inner.received)
            .iter()
            .filter(|received| received.as_str() == line)
            .count()
    }

    /// Forget the received lines.
    pub fn clear_log(&self) {
        lock(&self.inner.received).clear();
    }

    /// Make the next launch fail as if the executable were missing.
    pub fn inject_launch_failure(&self) {
        self.inner.fail_next_launch.store(true, Ordering::SeqCst);
    }

    /// Emit `line` unprompted right after the next command is processed.
    pub fn push_unsolicited(&self, line: &str) {
        lock(&self.inner.unsolicited).push_back(line.to_string());
    }

    /// Kill the running instance abruptly: its pipes are dropped without an exit.
    ///
    /// Resolves once the pipes are gone, so the next write to the helper fails with a
    /// broken pipe. Returns `false` if no instance was running.
    pub async fn crash(&self) -> bool {
        let signal = lock(&self.inner.crash).take();
        let Some(signal) = signal else {
            return false;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if signal.send(ack_tx).is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }
}

impl HelperLauncher for MockHelper {
    fn launch(&self) -> AdapterResult<HelperProcess> {
        if self.inner.fail_next_launch.swap(false, Ordering::SeqCst) {
            return Err(AdapterError::Launch {
                path: self.describe(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        self.inner.launches.fetch_add(1, Ordering::SeqCst);

        let (client_stdin, helper_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (helper_stdout, client_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (crash_tx, crash_rx) = oneshot::channel();
        *lock(&self.inner.crash) = Some(crash_tx);

        let task = tokio::spawn(run_instance(
            Arc::clone(&self.inner),
            helper_stdin,
            helper_stdout,
            crash_rx,
        ));

        Ok(HelperProcess {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            child: Box::new(MockChild { task }),
        })
    }

    fn describe(&self) -> String {
        "mock hpctrl -i".to_string()
    }
}

struct MockChild {
    task: JoinHandle<()>,
}

#[async_trait]
impl HelperChild for MockChild {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, &mut self.task).await.is_ok()
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.task.abort();
        // Cancelled or finished, the task is gone either way
        let _ = (&mut self.task).await;
        Ok(())
    }
}

/// Instrument state the fake helper keeps between commands.
struct InstrumentState {
    acquire_points: u32,
    acquire_count: u32,
    average: bool,
    preamble: bool,
    enabled_channels: BTreeSet<u8>,
    output_file: Option<String>,
}

impl Default for InstrumentState {
    fn default() -> Self {
        Self {
            acquire_points: 100,
            acquire_count: 200,
            average: true,
            preamble: false,
            enabled_channels: BTreeSet::from([1, 3]),
            output_file: None,
        }
    }
}

enum Reply {
    Lines(Vec<String>),
    Exit,
}

impl InstrumentState {
    fn handle(&mut self, raw: &str, identification: Option<&str>) -> Reply {
        let command = raw.trim().to_lowercase();
        let single = |text: String| Reply::Lines(vec![text]);
        let flag = |on: bool| single(if on { "1" } else { "0" }.to_string());

        match command.as_str() {
            "exit" => return Reply::Exit,
            "q *idn?" => {
                return Reply::Lines(identification.map(str::to_string).into_iter().collect())
            }
            "16" => return Reply::Lines(MOCK_WAVEFORM.iter().map(|s| s.to_string()).collect()),
            "q :waveform:preamble?" => return single(MOCK_PREAMBLE.to_string()),
            "pon" => self.preamble = true,
            "poff" => self.preamble = false,
            "q :acquire:count?" => return single(self.acquire_count.to_string()),
            "q :acquire:points?" => return single(self.acquire_points.to_string()),
            "s :acquire:average on" => self.average = true,
            "s :acquire:average off" => self.average = false,
            "q :acquire:average?" => return flag(self.average),
            "?" => {
                if self.output_file.is_some() {
                    return single(MOCK_FILE_WRITTEN.to_string());
                }
            }
            _ => {}
        }

        if let Some(path) = raw.trim().strip_prefix("file") {
            self.output_file = Some(path.trim().to_string());
        } else if let Some(value) = command.strip_prefix("s :acquire:points") {
            if let Ok(points) = value.trim().parse() {
                self.acquire_points = points;
            }
        } else if let Some(value) = command.strip_prefix("s :acquire:count") {
            if let Ok(count) = value.trim().parse() {
                self.acquire_count = count;
            }
        } else if let Some(channel) = channel_display_query(&command) {
            return flag(self.enabled_channels.contains(&channel));
        }

        Reply::Lines(Vec::new())
    }
}

/// Channel number of a `q :channel<N>:display?` query.
fn channel_display_query(command: &str) -> Option<u8> {
    let number = command
        .strip_prefix("q :channel")?
        .strip_suffix(":display?")?;
    match number.parse() {
        Ok(n @ 1..=4) => Some(n),
        _ => None,
    }
}

async fn run_instance(
    inner: Arc<MockInner>,
    stdin: DuplexStream,
    stdout: DuplexStream,
    crash: oneshot::Receiver<oneshot::Sender<()>>,
) {
    // Pipes are dropped when `serve` returns, before the crash is acknowledged
    if let Some(ack) = serve(&inner, stdin, stdout, crash).await {
        let _ = ack.send(());
    }
}

async fn serve(
    inner: &MockInner,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut crash: oneshot::Receiver<oneshot::Sender<()>>,
) -> Option<oneshot::Sender<()>> {
    let mut lines = BufReader::new(stdin).lines();
    let mut state = InstrumentState::default();
    let mut crash_armed = true;

    loop {
        tokio::select! {
            signal = &mut crash, if crash_armed => match signal {
                Ok(ack) => return Some(ack),
                // Superseded by a newer launch
                Err(_) => crash_armed = false,
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    return None;
                };
                lock(&inner.received).push(line.trim().to_string());

                let latency = *lock(&inner.latency);
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }

                let identification = lock(&inner.identification).clone();
                let mut output = match state.handle(&line, identification.as_deref()) {
                    Reply::Exit => return None,
                    Reply::Lines(output) => output,
                };
                output.extend(lock(&inner.unsolicited).drain(..));

                for text in output {
                    if stdout.write_all(format!("{text}\n").as_bytes()).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
