use crate::call::{CallId, Namespace, OPTEE_PREFIX, OPTEE_VARIABLE_BITS};
use crate::controller::ControllerSettings;
use crate::corpus::{CorpusError, CorpusTable};
use crate::gate::CommandGateConfig;
use crate::generator::DEFAULT_CORPUS_WEIGHT;
use crate::oracle::DEFAULT_FINDING_CAPACITY;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("namespace prefix 0x{prefix:08x} overlaps variable bits 0x{variable_bits:08x}")]
    InvalidNamespace { prefix: u32, variable_bits: u32 },
    #[error("corpus-weight must be within 0.0..=1.0, got {0}")]
    InvalidCorpusWeight(f64),
    #[error("yield-every must be greater than zero")]
    ZeroYieldInterval,
    #[error("gate-type is 'command' but [gate.command-settings] is missing")]
    MissingCommandSettings,
    #[error("invalid corpus: {0}")]
    Corpus(#[from] CorpusError),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GateType {
    #[default]
    InProcess,
    Command,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandGateSettings {
    pub command: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    #[serde(default)]
    pub gate_type: GateType,
    #[serde(default)]
    pub command_settings: Option<CommandGateSettings>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    #[serde(default = "default_iterations")]
    pub default_iterations: u64,
    #[serde(default = "default_yield_every")]
    pub yield_every: u64,
    #[serde(default)]
    pub max_iterations_per_command: Option<u64>,
    #[serde(default = "default_corpus_weight")]
    pub corpus_weight: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

pub fn default_iterations() -> u64 {
    1000
}
pub fn default_yield_every() -> u64 {
    100
}
fn default_corpus_weight() -> f64 {
    DEFAULT_CORPUS_WEIGHT
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            default_iterations: default_iterations(),
            yield_every: default_yield_every(),
            max_iterations_per_command: None,
            corpus_weight: default_corpus_weight(),
            seed: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct NamespaceConfig {
    #[serde(default = "default_prefix")]
    pub prefix: u32,
    #[serde(default = "default_variable_bits")]
    pub variable_bits: u32,
}

fn default_prefix() -> u32 {
    OPTEE_PREFIX
}
fn default_variable_bits() -> u32 {
    OPTEE_VARIABLE_BITS
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            variable_bits: default_variable_bits(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    /// Replaces the built-in OP-TEE table when present.
    #[serde(default)]
    pub ids: Option<Vec<u32>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TriageConfig {
    #[serde(default)]
    pub report_rejections: bool,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_FINDING_CAPACITY
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            report_rejections: false,
            capacity: default_capacity(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SmcFuzzConfig {
    #[serde(default)]
    pub campaign: CampaignSettings,
    #[serde(default)]
    pub namespace: NamespaceConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub triage: TriageConfig,
}

impl SmcFuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SmcFuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        config.validate()?;

        Ok(config)
    }

    /// Checks every setting that serde cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let namespace = self.namespace()?;
        if !(0.0..=1.0).contains(&self.campaign.corpus_weight) {
            return Err(ConfigError::InvalidCorpusWeight(self.campaign.corpus_weight));
        }
        if self.campaign.yield_every == 0 {
            return Err(ConfigError::ZeroYieldInterval);
        }
        if self.gate.gate_type == GateType::Command && self.gate.command_settings.is_none() {
            return Err(ConfigError::MissingCommandSettings);
        }
        self.corpus_table(&namespace)?;
        Ok(())
    }

    pub fn namespace(&self) -> Result<Namespace, ConfigError> {
        let NamespaceConfig {
            prefix,
            variable_bits,
        } = self.namespace;
        Namespace::new(prefix, variable_bits).ok_or(ConfigError::InvalidNamespace {
            prefix,
            variable_bits,
        })
    }

    pub fn corpus_table(&self, namespace: &Namespace) -> Result<CorpusTable, ConfigError> {
        match &self.corpus.ids {
            Some(ids) => {
                let ids: Vec<CallId> = ids.iter().copied().map(CallId).collect();
                Ok(CorpusTable::from_ids(&ids, namespace)?)
            }
            None => Ok(CorpusTable::new(CorpusTable::optee().list().to_vec(), namespace)?),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            yield_every: self.campaign.yield_every,
            max_iterations_per_command: self.campaign.max_iterations_per_command,
            report_rejections: self.triage.report_rejections,
            finding_capacity: self.triage.capacity,
        }
    }

    /// The command gate configuration, if the gate is command-backed.
    pub fn command_gate_config(&self) -> Result<Option<CommandGateConfig>, ConfigError> {
        if self.gate.gate_type != GateType::Command {
            return Ok(None);
        }
        let settings = self
            .gate
            .command_settings
            .as_ref()
            .ok_or(ConfigError::MissingCommandSettings)?;
        Ok(Some(CommandGateConfig {
            command: settings.command.clone(),
            timeout: Duration::from_millis(settings.timeout_ms),
            working_dir: settings.working_dir.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config: SmcFuzzConfig = toml::from_str("").expect("empty config parses");
        config.validate().expect("defaults are valid");
        assert_eq!(config.campaign.default_iterations, 1000);
        assert_eq!(config.campaign.yield_every, 100);
        assert_eq!(config.campaign.max_iterations_per_command, None);
        assert_eq!(config.gate.gate_type, GateType::InProcess);
        assert_eq!(config.namespace().unwrap(), Namespace::optee());
        assert_eq!(config.corpus_table(&Namespace::optee()).unwrap().len(), 6);
        assert!(config.command_gate_config().unwrap().is_none());
    }

    #[test]
    fn full_document_parses_hex_and_kebab_case_keys() {
        let doc = r#"
            [campaign]
            default-iterations = 50
            yield-every = 10
            max-iterations-per-command = 500
            corpus-weight = 0.25
            seed = 7

            [namespace]
            prefix = 0xb2000000
            variable-bits = 0x00ffffff

            [corpus]
            ids = [0xb2000004, 0xb2000042]

            [gate]
            gate-type = "command"
            [gate.command-settings]
            command = ["/usr/local/bin/smc-bridge", "--raw"]
            timeout-ms = 250

            [triage]
            report-rejections = true
            capacity = 8
        "#;
        let config: SmcFuzzConfig = toml::from_str(doc).expect("valid config");
        config.validate().expect("valid settings");

        let settings = config.controller_settings();
        assert_eq!(settings.yield_every, 10);
        assert_eq!(settings.max_iterations_per_command, Some(500));
        assert!(settings.report_rejections);
        assert_eq!(settings.finding_capacity, 8);
        assert_eq!(config.campaign.seed, Some(7));

        let table = config.corpus_table(&config.namespace().unwrap()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.list()[0].name, "CALL_WITH_ARG");

        let gate = config.command_gate_config().unwrap().expect("command gate");
        assert_eq!(gate.command[1], "--raw");
        assert_eq!(gate.timeout, Duration::from_millis(250));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<SmcFuzzConfig, _> = toml::from_str("[campaign]\nthreads = 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn validate_catches_inconsistent_settings() {
        let mut config = SmcFuzzConfig::default();
        config.campaign.corpus_weight = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCorpusWeight(_))));

        let mut config = SmcFuzzConfig::default();
        config.campaign.yield_every = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroYieldInterval)));

        let mut config = SmcFuzzConfig::default();
        config.gate.gate_type = GateType::Command;
        assert!(matches!(config.validate(), Err(ConfigError::MissingCommandSettings)));

        let mut config = SmcFuzzConfig::default();
        config.namespace.prefix = 0xb200_0001;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidNamespace { .. })));

        let mut config = SmcFuzzConfig::default();
        config.corpus.ids = Some(vec![0x8400_0000]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Corpus(CorpusError::OutsideNamespace { .. }))
        ));
    }

    #[test]
    fn load_from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[campaign]\ndefault-iterations = 3").expect("write config");
        let config = SmcFuzzConfig::load_from_file(file.path()).expect("loads");
        assert_eq!(config.campaign.default_iterations, 3);

        let mut bad = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(bad, "[campaign]\nyield-every = 0").expect("write config");
        let err = SmcFuzzConfig::load_from_file(bad.path()).unwrap_err();
        assert!(err.to_string().contains("yield-every"));
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let err = SmcFuzzConfig::load_from_file(Path::new("/nonexistent/smcfuzz.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
