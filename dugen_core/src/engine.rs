use crate::handle::{Candidate, PutRecord};
use crate::metadata::ObservedEntity;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Longest stderr excerpt carried in an error.
const STDERR_EXCERPT_BYTES: usize = 512;

/// Ways the external test engine can fail to deliver a coverage report.
///
/// All of them are reported to the orchestrator as an unavailable engine:
/// the cycle ends with no new coverage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Test engine did not respond within {0:?}")]
    TimedOut(Duration),
    #[error("Failed to launch test engine: {0}")]
    Launch(String),
    #[error("Test engine failed: {0}")]
    Crashed(String),
    #[error("Test engine produced an unreadable report: {0}")]
    BadReport(String),
    #[error("Test engine I/O error: {0}")]
    Io(String),
}

/// What the engine sends back after exploring a batch.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageReport {
    /// Triples the engine observed being exercised.
    #[serde(default)]
    pub covered: Vec<Candidate>,
    /// Entities seen at runtime, appended to the dynamic metadata view.
    #[serde(default)]
    pub observed: Vec<ObservedEntity>,
}

#[derive(Serialize)]
struct BatchEntry<'a> {
    declaring_type: &'a str,
    body: &'a str,
    target: Candidate,
}

#[derive(Serialize)]
struct Batch<'a> {
    puts: Vec<BatchEntry<'a>>,
}

/// Serializes a batch as the JSON document handed to external engines.
pub fn encode_batch(batch: &[PutRecord]) -> Result<Vec<u8>, EngineError> {
    let document = Batch {
        puts: batch
            .iter()
            .map(|record| BatchEntry {
                declaring_type: record.declaring_type.as_str(),
                body: &record.body,
                target: record.pair.to_candidate(),
            })
            .collect(),
    };
    serde_json::to_vec_pretty(&document)
        .map_err(|e| EngineError::Io(format!("Failed to encode PUT batch: {e}")))
}

pub fn decode_report(bytes: &[u8]) -> Result<CoverageReport, EngineError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(CoverageReport::default());
    }
    serde_json::from_slice(bytes).map_err(|e| EngineError::BadReport(e.to_string()))
}

/// The external test-exploration engine.
///
/// Implementations must return within roughly `timeout`, answering
/// `EngineError::TimedOut` if the engine has not reported by then.
pub trait TestEngine: Send {
    fn name(&self) -> &'static str;

    fn run(&mut self, batch: &[PutRecord], timeout: Duration)
    -> Result<CoverageReport, EngineError>;
}

/// Default cap on harness threads still running after their run timed out.
pub const DEFAULT_MAX_ABANDONED_HARNESSES: usize = 4;

/// Runs a harness closure in-process, on a worker thread so that a slow
/// harness can be abandoned when the timeout expires.
///
/// A thread cannot be killed, so an abandoned harness keeps running until it
/// returns. At most `max_abandoned` such threads may be outstanding; past that
/// `run` fails with `EngineError::Launch` instead of spawning another one.
pub struct InProcessEngine<F>
where
    F: Fn(&[PutRecord]) -> CoverageReport + Send + Sync + 'static,
{
    harness: Arc<F>,
    in_flight: Arc<AtomicUsize>,
    max_abandoned: usize,
}

impl<F> InProcessEngine<F>
where
    F: Fn(&[PutRecord]) -> CoverageReport + Send + Sync + 'static,
{
    pub fn new(harness: F) -> Self {
        Self {
            harness: Arc::new(harness),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_abandoned: DEFAULT_MAX_ABANDONED_HARNESSES,
        }
    }

    pub fn with_max_abandoned(mut self, max_abandoned: usize) -> Self {
        self.max_abandoned = max_abandoned;
        self
    }

    /// Harness threads currently running, abandoned ones included.
    pub fn running_harnesses(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl<F> TestEngine for InProcessEngine<F>
where
    F: Fn(&[PutRecord]) -> CoverageReport + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn run(
        &mut self,
        batch: &[PutRecord],
        timeout: Duration,
    ) -> Result<CoverageReport, EngineError> {
        let abandoned = self.in_flight.load(Ordering::SeqCst);
        if abandoned >= self.max_abandoned {
            return Err(EngineError::Launch(format!(
                "{abandoned} harness threads from timed-out runs are still running"
            )));
        }

        let (tx, rx) = mpsc::channel();
        let harness = Arc::clone(&self.harness);
        let in_flight = Arc::clone(&self.in_flight);
        let owned_batch = batch.to_vec();

        in_flight.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name("dugen-in-process-engine".to_string())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| harness(&owned_batch)));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                // receiver may be gone after a timeout
                let _ = tx.send(result.map_err(|payload| panic_message(payload.as_ref())));
            });
        if let Err(e) = spawned {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Launch(format!("Failed to spawn engine thread: {e}")));
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(message)) => Err(EngineError::Crashed(format!("harness panicked: {message}"))),
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "In-process engine timed out, abandoning harness thread");
                Err(EngineError::TimedOut(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Crashed(
                "harness thread exited without a report".to_string(),
            )),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// How the batch document reaches an external engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDelivery {
    StdIn,
    /// Written to a temp file; `{}` in the template is replaced by its path
    /// and the result appended to the command line.
    File(String),
}

#[derive(Debug, Clone)]
pub struct CommandEngineConfig {
    pub command: Vec<String>,
    pub delivery: BatchDelivery,
    pub working_dir: Option<PathBuf>,
}

/// Runs the test engine as a child process.
///
/// The engine reads the batch (see [`encode_batch`]) and writes a JSON
/// [`CoverageReport`] to stdout. A non-zero exit is a failure.
pub struct CommandEngine {
    config: CommandEngineConfig,
}

impl CommandEngine {
    pub fn new(config: CommandEngineConfig) -> Self {
        Self { config }
    }

    fn wait_with_timeout(
        &self,
        child: &mut Child,
        start_time: Instant,
        timeout: Duration,
    ) -> Result<ExitStatus, EngineError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        warn!(?timeout, "Test engine timed out, killing");
                        if let Err(e) = child.kill() {
                            error!("Failed to kill test engine process: {e}");
                            return Err(EngineError::Io(format!(
                                "Failed to kill timed-out engine: {e}"
                            )));
                        }
                        let _ = child.wait();
                        return Err(EngineError::TimedOut(timeout));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(EngineError::Io(format!("Error waiting for engine: {e}")));
                }
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = source.read_to_end(&mut buffer);
        let _ = tx.send(buffer);
    });
    rx
}

/// Waits for a reader to hit EOF, but no later than `deadline`.
///
/// A process the engine left running in the background can hold the pipe
/// open after the engine itself exited.
fn collect_output(
    reader: Option<Receiver<Vec<u8>>>,
    deadline: Instant,
) -> Result<Vec<u8>, RecvTimeoutError> {
    match reader {
        Some(rx) => match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Err(RecvTimeoutError::Disconnected) => Ok(Vec::new()),
            other => other,
        },
        None => Ok(Vec::new()),
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("Exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Terminated by signal {signal}");
        }
    }
    "Exited abnormally".to_string()
}

impl TestEngine for CommandEngine {
    fn name(&self) -> &'static str {
        "command"
    }

    fn run(
        &mut self,
        batch: &[PutRecord],
        timeout: Duration,
    ) -> Result<CoverageReport, EngineError> {
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(EngineError::Launch("engine command is empty".to_string()));
        };
        let document = encode_batch(batch)?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        let mut temp_file_handle: Option<tempfile::NamedTempFile> = None;
        match &self.config.delivery {
            BatchDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            BatchDelivery::File(arg_template) => {
                let mut named_temp_file = tempfile::NamedTempFile::new()
                    .map_err(|e| EngineError::Io(format!("Failed to create temp file: {e}")))?;
                named_temp_file.write_all(&document).map_err(|e| {
                    EngineError::Io(format!(
                        "Failed to write batch to {:?}: {e}",
                        named_temp_file.path()
                    ))
                })?;
                let path_str = named_temp_file.path().to_str().ok_or_else(|| {
                    EngineError::Io("Temp file path is not valid UTF-8".to_string())
                })?;
                for part in arg_template.replace("{}", path_str).split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                temp_file_handle = Some(named_temp_file);
            }
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let start_time = Instant::now();
        let deadline = start_time + timeout;
        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Launch(format!(
                "Failed to spawn command '{:?}': {}",
                self.config.command, e
            ))
        })?;
        debug!(command = ?self.config.command, puts = batch.len(), "Launched test engine");

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);
        if let Some(mut child_stdin) = child.stdin.take() {
            // the engine may exit without draining stdin; a broken pipe shows up
            // through its exit status
            std::thread::spawn(move || {
                let _ = child_stdin.write_all(&document);
            });
        }

        let status = self.wait_with_timeout(&mut child, start_time, timeout)?;
        drop(temp_file_handle);

        if !status.success() {
            let stderr = collect_output(stderr_reader, deadline).unwrap_or_default();
            let excerpt_start = stderr.len().saturating_sub(STDERR_EXCERPT_BYTES);
            let excerpt = String::from_utf8_lossy(&stderr[excerpt_start..]);
            let excerpt = excerpt.trim();
            let description = if excerpt.is_empty() {
                describe_exit(&status)
            } else {
                format!("{}: {}", describe_exit(&status), excerpt)
            };
            return Err(EngineError::Crashed(description));
        }
        let stdout = collect_output(stdout_reader, deadline).map_err(|_| {
            warn!(?timeout, "Test engine exited but its stdout stayed open");
            EngineError::TimedOut(timeout)
        })?;
        decode_report(&stdout)
    }
}


#[cfg(test)]
mod command_engine_tests {
    use super::*;

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn shell_engine(script: &str, delivery: BatchDelivery) -> CommandEngine {
        let target_path = get_test_target_path(script);
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        CommandEngine::new(CommandEngineConfig {
            command: vec!["sh".to_string(), target_path.to_str().unwrap().to_string()],
            delivery,
            working_dir: None,
        })
    }

    #[test]
    fn cmd_engine_reads_report_from_stdout() {
        let mut engine = shell_engine("engine_report_ok.sh", BatchDelivery::StdIn);
        let report = engine.run(&[], Duration::from_secs(5)).unwrap();
        assert_eq!(report.covered, vec![Candidate::new("T.F", "T.Set", "T.Get")]);
        assert_eq!(report.observed.len(), 1);
    }

    #[test]
    fn cmd_engine_batch_via_file() {
        let delivery = BatchDelivery::File("{}".to_string());
        let mut engine = shell_engine("engine_file_check.sh", delivery);
        let report = engine.run(&[], Duration::from_secs(5)).unwrap();
        assert_eq!(report.covered.len(), 1);
    }

    #[test]
    fn cmd_engine_nonzero_exit_is_crash() {
        let mut engine = shell_engine("engine_crash.sh", BatchDelivery::StdIn);
        match engine.run(&[], Duration::from_secs(5)) {
            Err(EngineError::Crashed(desc)) => {
                assert!(desc.contains("code 3"), "Unexpected crash desc: {desc}");
                assert!(desc.contains("engine exploded"), "Missing stderr: {desc}");
            }
            other => panic!("Expected Crashed, got {other:?}"),
        }
    }

    #[test]
    fn cmd_engine_timeout() {
        let mut engine = shell_engine("engine_timeout.sh", BatchDelivery::StdIn);
        let timeout = Duration::from_millis(100); // script sleeps 5s
        assert_eq!(engine.run(&[], timeout), Err(EngineError::TimedOut(timeout)));
    }

    #[test]
    fn cmd_engine_orphaned_stdout_respects_timeout() {
        let mut engine = shell_engine("engine_orphan_stdout.sh", BatchDelivery::StdIn);
        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        assert_eq!(engine.run(&[], timeout), Err(EngineError::TimedOut(timeout)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn cmd_engine_garbage_output_is_bad_report() {
        let mut engine = shell_engine("engine_garbage.sh", BatchDelivery::StdIn);
        assert!(matches!(
            engine.run(&[], Duration::from_secs(5)),
            Err(EngineError::BadReport(_))
        ));
    }

    #[test]
    fn cmd_engine_invalid_command() {
        let mut engine = CommandEngine::new(CommandEngineConfig {
            command: vec!["./this_command_does_not_exist_ever_12345.sh".to_string()],
            delivery: BatchDelivery::StdIn,
            working_dir: None,
        });
        match engine.run(&[], Duration::from_secs(1)) {
            Err(EngineError::Launch(msg)) => assert!(msg.contains("Failed to spawn command")),
            other => panic!("Expected Launch error, got {other:?}"),
        }
    }

    #[test]
    fn cmd_engine_empty_command() {
        let mut engine = CommandEngine::new(CommandEngineConfig {
            command: vec![],
            delivery: BatchDelivery::StdIn,
            working_dir: None,
        });
        assert!(matches!(
            engine.run(&[], Duration::from_secs(1)),
            Err(EngineError::Launch(_))
        ));
    }
}
