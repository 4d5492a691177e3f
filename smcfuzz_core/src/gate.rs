use crate::call::{CallId, ParamVector};
use std::collections::VecDeque;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Ways a single invocation can fail to produce a result register.
///
/// `Timeout` and `Crashed` are watchdog reports: only a gate that supervises
/// the call from outside the calling context (the command gate watching its
/// helper process) can produce them. In-process gates never do.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateFault {
    /// The supervised call did not return within the watchdog deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// The supervised calling context died while the call was in flight.
    #[error("call crashed: {0}")]
    Crashed(String),
    /// The gate itself failed before or after the call (spawn, pipes, waiting).
    #[error("gate I/O failure: {0}")]
    Io(String),
    /// The gate returned something that is not a result register.
    #[error("malformed gate response: {0}")]
    Protocol(String),
}

impl GateFault {
    /// Watchdog reports about the call under test; everything else is a
    /// broken gate.
    pub fn is_target_fault(&self) -> bool {
        matches!(self, GateFault::Timeout(_) | GateFault::Crashed(_))
    }
}

#[derive(Error, Debug)]
pub enum GateSetupError {
    #[error("command gate needs a non-empty command line")]
    EmptyCommand,
    #[error("command gate timeout must be greater than zero")]
    ZeroTimeout,
}

/// The privileged call primitive.
///
/// Implementations issue exactly one synchronous call per `invoke` and return
/// the primary result register. There is no cancellation: an implementation
/// that never returns blocks its caller.
pub trait CallGate: Send {
    fn name(&self) -> &str;
    fn invoke(&mut self, id: CallId, params: &ParamVector) -> Result<u64, GateFault>;
}

impl<G: CallGate + ?Sized> CallGate for Box<G> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&mut self, id: CallId, params: &ParamVector) -> Result<u64, GateFault> {
        (**self).invoke(id, params)
    }
}

/// Runs the call in-process through a closure.
///
/// Nothing supervises the closure: a panic unwinds through the caller and a
/// closure that never returns blocks it.
pub struct FnGate<F>
where
    F: FnMut(CallId, &ParamVector) -> u64,
{
    name: String,
    call_fn: F,
}

impl<F> FnGate<F>
where
    F: FnMut(CallId, &ParamVector) -> u64,
{
    pub fn new(name: impl Into<String>, call_fn: F) -> Self {
        Self {
            name: name.into(),
            call_fn,
        }
    }
}

impl<F> CallGate for FnGate<F>
where
    F: FnMut(CallId, &ParamVector) -> u64 + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&mut self, id: CallId, params: &ParamVector) -> Result<u64, GateFault> {
        Ok((self.call_fn)(id, params))
    }
}

pub struct CommandGateConfig {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

/// Forwards each call to an external helper process.
///
/// The helper is started once per call with the function id and the six
/// parameters appended as `0x`-prefixed hex arguments, and must print the
/// result register (hex with `0x`, or decimal, optionally negative) on the
/// first line of stdout. The helper is what actually crosses the privilege
/// boundary, e.g. by forwarding to a kernel driver.
pub struct CommandGate {
    config: CommandGateConfig,
}

impl CommandGate {
    pub fn new(config: CommandGateConfig) -> Result<Self, GateSetupError> {
        if config.command.is_empty() {
            return Err(GateSetupError::EmptyCommand);
        }
        if config.timeout.is_zero() {
            return Err(GateSetupError::ZeroTimeout);
        }
        Ok(Self { config })
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<ExitStatus, GateFault> {
        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > self.config.timeout {
                        tracing::warn!(
                            "gate helper exceeded {:?}, killing it",
                            self.config.timeout
                        );
                        if let Err(e) = child.kill() {
                            return Err(GateFault::Io(format!(
                                "Failed to kill timed-out helper: {e}"
                            )));
                        }
                        let _ = child.wait();
                        return Err(GateFault::Timeout(self.config.timeout));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(GateFault::Io(format!("Error waiting for helper: {e}"))),
            }
        }
    }
}

fn describe_abnormal_exit(status: &ExitStatus) -> String {
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

/// Parses a result register printed by a helper.
pub fn parse_result(text: &str) -> Result<u64, GateFault> {
    let line = text.lines().next().unwrap_or("").trim();
    let parsed = if let Some(hex) = line
        .strip_prefix("0x")
        .or_else(|| line.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else if line.starts_with('-') {
        line.parse::<i64>().ok().map(|v| v as u64)
    } else {
        line.parse::<u64>().ok()
    };
    parsed.ok_or_else(|| GateFault::Protocol(format!("expected a result register, got {line:?}")))
}

impl CallGate for CommandGate {
    fn name(&self) -> &str {
        &self.config.command[0]
    }

    fn invoke(&mut self, id: CallId, params: &ParamVector) -> Result<u64, GateFault> {
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]);
        cmd.arg(format!("0x{:08x}", id.raw()));
        for param in params {
            cmd.arg(format!("0x{param:x}"));
        }
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            GateFault::Io(format!(
                "Failed to spawn command '{:?}': {e}",
                self.config.command
            ))
        })?;

        // Drain stdout while the helper runs so a chatty helper cannot fill
        // the pipe and stall until the deadline.
        let Some(mut pipe) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(GateFault::Io("Helper stdout was not captured".to_string()));
        };
        let reader = std::thread::spawn(move || {
            let mut stdout = String::new();
            pipe.read_to_string(&mut stdout).map(|_| stdout)
        });

        // On timeout the reader is left detached.
        let status = self.wait_with_timeout(&mut child)?;
        let output = reader
            .join()
            .map_err(|_| GateFault::Io("Helper stdout reader panicked".to_string()))?;
        if !status.success() {
            return Err(GateFault::Crashed(describe_abnormal_exit(&status)));
        }
        let stdout =
            output.map_err(|e| GateFault::Io(format!("Failed to read helper stdout: {e}")))?;
        parse_result(&stdout)
    }
}

/// Every `(id, params)` pair a [`ScriptedGate`] was invoked with, in order.
pub type CallLog = Arc<Mutex<Vec<(CallId, ParamVector)>>>;

/// Replays prescribed results and records the calls it receives.
///
/// Once the script runs dry every further call returns `fallback`.
pub struct ScriptedGate {
    script: VecDeque<Result<u64, GateFault>>,
    fallback: u64,
    calls: CallLog,
}

impl ScriptedGate {
    pub fn new(script: impl IntoIterator<Item = Result<u64, GateFault>>, fallback: u64) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback,
            calls: CallLog::default(),
        }
    }

    /// A gate that answers every call with `result`.
    pub fn constant(result: u64) -> Self {
        Self::new(std::iter::empty(), result)
    }

    /// Shared view of the call log, usable after the gate has been moved away.
    pub fn call_log(&self) -> CallLog {
        Arc::clone(&self.calls)
    }
}

impl CallGate for ScriptedGate {
    fn name(&self) -> &str {
        "scripted"
    }

    fn invoke(&mut self, id: CallId, params: &ParamVector) -> Result<u64, GateFault> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((id, *params));
        }
        self.script.pop_front().unwrap_or(Ok(self.fallback))
    }
}


#[cfg(test)]
mod command_gate_tests {
    use super::*;
    use crate::call::ZERO_PARAMS;

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn sh_gate(script: &str, timeout: Duration) -> CommandGate {
        let target_path = get_test_target_path(script);
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        CommandGate::new(CommandGateConfig {
            command: vec!["sh".to_string(), target_path.to_string_lossy().into_owned()],
            timeout,
            working_dir: None,
        })
        .expect("valid command gate")
    }

    #[test]
    fn cmd_gate_passes_id_and_params_and_parses_result() {
        let mut gate = sh_gate("smc_echo.sh", Duration::from_secs(2));
        // The helper answers with its second parameter.
        let result = gate.invoke(CallId(0xb200_0004), &[0, 0x1234, 0, 0, 0, 0]);
        assert_eq!(result, Ok(0x1234));
    }

    #[test]
    fn cmd_gate_drains_output_larger_than_a_pipe_buffer() {
        let mut gate = sh_gate("smc_chatty.sh", Duration::from_secs(2));
        let result = gate.invoke(CallId(0xb200_0007), &ZERO_PARAMS);
        assert_eq!(result, Ok(0x7));
    }

    #[test]
    fn cmd_gate_reports_rejection_codes() {
        let mut gate = sh_gate("smc_echo.sh", Duration::from_secs(2));
        let result = gate.invoke(CallId(0xb2ff_ffff), &ZERO_PARAMS);
        assert_eq!(result, Ok(u64::MAX));
    }

    #[test]
    fn cmd_gate_crash_detection() {
        let mut gate = sh_gate("smc_crash.sh", Duration::from_secs(2));
        match gate.invoke(CallId(0xb200_0003), &ZERO_PARAMS) {
            Err(GateFault::Crashed(desc)) => {
                assert!(
                    desc.contains("code 139") || desc.contains("signal 11"),
                    "Unexpected crash desc: {desc}",
                );
            }
            other => panic!("Expected Crash, got {other:?}"),
        }
    }

    #[test]
    fn cmd_gate_timeout() {
        let mut gate = sh_gate("smc_hang.sh", Duration::from_millis(100));
        let result = gate.invoke(CallId(0xb200_0003), &ZERO_PARAMS);
        assert_eq!(result, Err(GateFault::Timeout(Duration::from_millis(100))));
    }

    #[test]
    fn cmd_gate_invalid_command() {
        let mut gate = CommandGate::new(CommandGateConfig {
            command: vec!["./this_command_does_not_exist_ever_12345.sh".to_string()],
            timeout: Duration::from_secs(1),
            working_dir: None,
        })
        .expect("valid config");
        match gate.invoke(CallId(0xb200_0003), &ZERO_PARAMS) {
            Err(GateFault::Io(msg)) => assert!(msg.contains("Failed to spawn command")),
            other => panic!("Expected Io fault, got {other:?}"),
        }
    }

    #[test]
    fn cmd_gate_rejects_empty_command_and_zero_timeout() {
        assert!(matches!(
            CommandGate::new(CommandGateConfig {
                command: vec![],
                timeout: Duration::from_secs(1),
                working_dir: None,
            }),
            Err(GateSetupError::EmptyCommand)
        ));
        assert!(matches!(
            CommandGate::new(CommandGateConfig {
                command: vec!["true".into()],
                timeout: Duration::ZERO,
                working_dir: None,
            }),
            Err(GateSetupError::ZeroTimeout)
        ));
    }
}
