pub mod call;
pub mod channel;
pub mod config;
pub mod controller;
pub mod corpus;
pub mod executor;
pub mod gate;
pub mod generator;
pub mod oracle;
pub mod stats;

pub use call::{CallId, Namespace, Outcome, PARAM_COUNT, ParamVector, ZERO_PARAMS};
pub use channel::{Command, CommandError, ControlChannel, MAX_COMMAND_LEN, Response};
pub use config::{ConfigError, SmcFuzzConfig};
pub use controller::{
    CampaignReport, Controller, ControllerError, ControllerSettings, ControllerState,
    SelfTestReport, StatusSnapshot, StopReason,
};
pub use corpus::{CorpusEntry, CorpusError, CorpusTable};
pub use executor::{CallExecutor, Execution, ExecutionStatus};
pub use gate::{CallGate, CommandGate, CommandGateConfig, FnGate, GateFault, ScriptedGate};
pub use generator::{ParamClass, ParamGenerator};
pub use oracle::{Finding, FindingLog, TriageOracle};
pub use stats::{CampaignStats, Statistics};
