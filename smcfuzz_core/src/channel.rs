use crate::controller::{
    CampaignReport, Controller, ControllerError, SelfTestReport, StatusSnapshot,
};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Writes of this many bytes or more are refused outright.
pub const MAX_COMMAND_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("command is {0} bytes, must be shorter than {max}", max = MAX_COMMAND_LEN)]
    TooLong(usize),
    #[error("command is not valid UTF-8")]
    NotUtf8,
    #[error("only one command per write is accepted")]
    Multiline,
    #[error("unknown command: {0:?}")]
    Unknown(String),
    #[error("'fuzz' requires an iteration count")]
    MissingCount,
    #[error("invalid iteration count: {0:?}")]
    InvalidCount(String),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Fuzz(u64),
    Test,
    Enable,
    Disable,
    Reset,
}

impl Command {
    /// Parses a single command line. Surrounding whitespace is ignored;
    /// keywords must match exactly.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_whitespace();
        let Some(keyword) = tokens.next() else {
            return Err(CommandError::Empty);
        };
        let command = match keyword {
            "fuzz" => {
                let count = tokens.next().ok_or(CommandError::MissingCount)?;
                let count = count
                    .parse::<u64>()
                    .map_err(|_| CommandError::InvalidCount(count.to_string()))?;
                Command::Fuzz(count)
            }
            "test" => Command::Test,
            "enable" => Command::Enable,
            "disable" => Command::Disable,
            "reset" => Command::Reset,
            _ => return Err(CommandError::Unknown(line.trim().to_string())),
        };
        if tokens.next().is_some() {
            return Err(CommandError::Unknown(line.trim().to_string()));
        }
        Ok(command)
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::parse(s)
    }
}

/// What an accepted command produced.
#[derive(Debug, Clone)]
pub enum Response {
    Campaign(CampaignReport),
    SelfTest(SelfTestReport),
    Enabled,
    Disabled,
    Reset,
}

/// Text command interface over a shared [`Controller`].
///
/// Mirrors a procfs-style control file: `write` takes one command per call
/// and `read` renders the current status block.
#[derive(Clone)]
pub struct ControlChannel {
    controller: Arc<Controller>,
}

impl ControlChannel {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Accepts one command and returns the number of bytes consumed.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, CommandError> {
        self.submit(bytes)?;
        Ok(bytes.len())
    }

    /// Like [`write`](Self::write), but hands back what the command produced.
    pub fn submit(&self, bytes: &[u8]) -> Result<Response, CommandError> {
        let command = decode(bytes)?;
        self.execute(command)
    }

    pub fn execute(&self, command: Command) -> Result<Response, CommandError> {
        let response = match command {
            Command::Fuzz(iterations) => Response::Campaign(self.controller.run(iterations)?),
            Command::Test => Response::SelfTest(self.controller.test_known()?),
            Command::Enable => {
                self.controller.enable();
                Response::Enabled
            }
            Command::Disable => {
                self.controller.disable();
                Response::Disabled
            }
            Command::Reset => {
                self.controller.reset()?;
                Response::Reset
            }
        };
        Ok(response)
    }

    pub fn read(&self) -> String {
        render_status(&self.controller.status())
    }

    pub fn read_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.controller.status())
    }
}

fn decode(bytes: &[u8]) -> Result<Command, CommandError> {
    if bytes.len() >= MAX_COMMAND_LEN {
        return Err(CommandError::TooLong(bytes.len()));
    }
    let text = std::str::from_utf8(bytes).map_err(|_| CommandError::NotUtf8)?;
    let line = text.trim();
    if line.contains(['\n', '\r']) {
        return Err(CommandError::Multiline);
    }
    Command::parse(line)
}

/// Formats a snapshot as the human-readable status block.
pub fn render_status(status: &StatusSnapshot) -> String {
    let stats = &status.stats;
    let mut out = String::with_capacity(768);
    let _ = writeln!(out, "SMC Fuzzer Status");
    let _ = writeln!(out, "=================");
    let _ = writeln!(
        out,
        "Fuzzing Enabled: {}",
        if status.enabled { "yes" } else { "no" }
    );
    let _ = writeln!(out, "State: {}", status.state);
    let _ = writeln!(out, "Total Iterations: {}", stats.total_iterations);
    let _ = writeln!(out, "Crashes: {}", stats.crashes);
    let _ = writeln!(out, "Hangs: {}", stats.hangs);
    let _ = writeln!(out, "Interesting Cases: {}", stats.interesting_cases);
    let _ = writeln!(out, "Valid Responses: {}", stats.valid_responses);
    let _ = writeln!(out, "Error Responses: {}", stats.error_responses);
    let _ = writeln!(out, "Last SMC ID: {}", stats.last_id);
    let _ = writeln!(out, "Last Result: {:#x}", stats.last_result);
    out.push_str(
        "\nCommands:\n\
         \x20 fuzz N      # Run N iterations\n\
         \x20 test        # Test known SMCs\n\
         \x20 enable      # Enable fuzzing\n\
         \x20 disable     # Disable fuzzing\n\
         \x20 reset       # Reset statistics\n",
    );
    if !status.findings.is_empty() {
        let _ = writeln!(
            out,
            "\nRecent Findings ({} unique, {} repeated):",
            status.unique_findings, status.duplicate_findings
        );
        for finding in &status.findings {
            let _ = writeln!(
                out,
                "  {} result={:#x} [{}] {}",
                finding.id, finding.result, finding.outcome, finding.fingerprint
            );
        }
    }
    out
}
