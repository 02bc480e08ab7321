use crate::engine::{BatchDelivery, CommandEngineConfig};
use crate::handle::DeclaringType;
use crate::metadata::{InMemoryMetadata, MetadataView, MetadataViews, ViewPolicy};
use crate::orchestrator::OrchestratorSettings;
use crate::store::SnapshotFormat;
use crate::strategy::{
    DEFAULT_PUT_TEMPLATE, GenerationStrategy, SeededTemplateStrategy, TemplateStrategy,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable that overrides `metadata.assembly`.
pub const ASSEMBLY_ENV_VAR: &str = "DUGEN_ASSEMBLY";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_cycles")]
    pub max_cycles: usize,
    #[serde(default = "default_max_engine_failures")]
    pub max_engine_failures: usize,
    #[serde(default = "default_engine_timeout_ms")]
    pub engine_timeout_ms: u64,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub types_of_interest: Vec<String>,
    #[serde(default)]
    pub view_policy: ViewPolicy,
}

pub fn default_max_cycles() -> usize {
    10
}
pub fn default_max_engine_failures() -> usize {
    3
}
fn default_engine_timeout_ms() -> u64 {
    30_000
}
pub fn default_threads() -> usize {
    1
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            max_engine_failures: default_max_engine_failures(),
            engine_timeout_ms: default_engine_timeout_ms(),
            threads: default_threads(),
            types_of_interest: Vec::new(),
            view_policy: ViewPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_cycles: self.max_cycles,
            max_engine_failures: self.max_engine_failures,
            engine_timeout: Duration::from_millis(self.engine_timeout_ms),
            types_of_interest: self
                .types_of_interest
                .iter()
                .map(|name| DeclaringType::new(name.as_str()))
                .collect(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandEngineSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    pub working_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EngineType {
    /// Harness linked into the host binary.
    InProcess,
    #[default]
    Command,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine_type: EngineType,
    #[serde(default)]
    pub command_settings: Option<CommandEngineSettings>,
}

impl EngineConfig {
    pub fn command_engine_config(&self) -> Result<CommandEngineConfig, anyhow::Error> {
        let settings = self.command_settings.as_ref().ok_or_else(|| {
            anyhow::anyhow!("Command engine selected but [engine.command-settings] is missing")
        })?;
        if settings.command.is_empty() {
            anyhow::bail!("engine.command-settings.command must not be empty");
        }
        let delivery = match &settings.input_delivery {
            ConfigInputDelivery::StdIn => BatchDelivery::StdIn,
            ConfigInputDelivery::File { template } => BatchDelivery::File(template.clone()),
        };
        Ok(CommandEngineConfig {
            command: settings.command.clone(),
            delivery,
            working_dir: settings.working_dir.clone(),
        })
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MetadataConfig {
    pub assembly: Option<String>,
    pub static_path: Option<PathBuf>,
    pub dynamic_path: Option<PathBuf>,
}

impl MetadataConfig {
    /// The assembly identifier, with `DUGEN_ASSEMBLY` taking precedence.
    pub fn resolved_assembly(&self) -> Option<String> {
        resolve_assembly(
            self.assembly.as_deref(),
            std::env::var(ASSEMBLY_ENV_VAR).ok().as_deref(),
        )
    }

    /// Loads both views. A missing path gives an empty view.
    pub fn load_views(&self, policy: ViewPolicy) -> Result<MetadataViews, anyhow::Error> {
        let assembly = self.resolved_assembly();
        let static_view = load_view(
            self.static_path.as_deref(),
            MetadataView::Static,
            assembly.as_deref(),
        )?;
        let dynamic_view = load_view(
            self.dynamic_path.as_deref(),
            MetadataView::Dynamic,
            assembly.as_deref(),
        )?;
        Ok(MetadataViews::new(
            Arc::new(static_view),
            Arc::new(dynamic_view),
            policy,
        ))
    }
}

fn resolve_assembly(configured: Option<&str>, from_env: Option<&str>) -> Option<String> {
    from_env
        .filter(|value| !value.trim().is_empty())
        .or(configured)
        .map(str::to_string)
}

fn load_view(
    path: Option<&Path>,
    view: MetadataView,
    assembly: Option<&str>,
) -> Result<InMemoryMetadata, anyhow::Error> {
    match path {
        Some(path) => InMemoryMetadata::load_from_file(path, view, assembly).map_err(|e| {
            anyhow::anyhow!("Failed to load {} metadata from {:?}: {}", view.as_str(), path, e)
        }),
        None => Ok(InMemoryMetadata::new(view)),
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    /// Inline PUT template.
    pub template: Option<String>,
    /// File holding the PUT template. Mutually exclusive with `template`.
    pub template_path: Option<PathBuf>,
    #[serde(default)]
    pub seed_rows: usize,
    #[serde(default = "default_seed_args")]
    pub seed_args: usize,
}

fn default_seed_args() -> usize {
    2
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            template: None,
            template_path: None,
            seed_rows: 0,
            seed_args: default_seed_args(),
        }
    }
}

impl GenerationConfig {
    pub fn template_text(&self) -> Result<String, anyhow::Error> {
        match (&self.template, &self.template_path) {
            (Some(_), Some(_)) => anyhow::bail!(
                "generation.template and generation.template-path are mutually exclusive"
            ),
            (Some(inline), None) => Ok(inline.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Failed to read PUT template at {:?}: {}", path, e)),
            (None, None) => Ok(DEFAULT_PUT_TEMPLATE.to_string()),
        }
    }

    pub fn build_strategy(&self) -> Result<Box<dyn GenerationStrategy>, anyhow::Error> {
        let text = self.template_text()?;
        let template = TemplateStrategy::new(&text)
            .map_err(|e| anyhow::anyhow!("Invalid PUT template: {}", e))?;
        if self.seed_rows == 0 {
            return Ok(Box::new(template));
        }
        Ok(Box::new(SeededTemplateStrategy::new(
            template,
            self.seed_rows,
            self.seed_args,
        )))
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub persist_path: Option<PathBuf>,
    #[serde(default)]
    pub snapshot_format: SnapshotFormat,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub put_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DugenConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl DugenConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: DugenConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const FULL: &str = r#"
[orchestrator]
max-cycles = 4
max-engine-failures = 1
engine-timeout-ms = 250
threads = 2
types-of-interest = ["Ns.Account"]
view-policy = "dynamic"

[engine]
engine-type = "command"
[engine.command-settings]
command = ["./engine", "--json"]
input-delivery = { file = { template = "--batch={}" } }

[metadata]
assembly = "Bank"

[generation]
template = "put {name} on {type}"
seed-rows = 3

[store]
persist-path = "state/store.bin"
snapshot-format = "bincode"

[output]
put-dir = "puts"
"#;

    #[test]
    fn empty_file_uses_defaults() {
        let config: DugenConfig = toml::from_str("").unwrap();
        assert_eq!(config.orchestrator.max_cycles, 10);
        assert_eq!(config.orchestrator.max_engine_failures, 3);
        assert_eq!(config.orchestrator.view_policy, ViewPolicy::StaticThenDynamic);
        assert_eq!(config.engine.engine_type, EngineType::Command);
        assert!(config.engine.command_settings.is_none());
        assert_eq!(config.store.snapshot_format, SnapshotFormat::Json);
        assert_eq!(config.generation.seed_args, 2);
    }

    #[test]
    fn full_file_parses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dugen.toml");
        fs::write(&path, FULL).unwrap();
        let config = DugenConfig::load_from_file(&path).unwrap();

        let settings = config.orchestrator.settings();
        assert_eq!(settings.max_cycles, 4);
        assert_eq!(settings.engine_timeout, Duration::from_millis(250));
        assert_eq!(settings.types_of_interest, vec![DeclaringType::from("Ns.Account")]);
        assert_eq!(config.orchestrator.view_policy, ViewPolicy::Dynamic);

        let engine = config.engine.command_engine_config().unwrap();
        assert_eq!(engine.command, vec!["./engine", "--json"]);
        assert_eq!(engine.delivery, BatchDelivery::File("--batch={}".to_string()));

        assert_eq!(config.metadata.assembly.as_deref(), Some("Bank"));
        assert_eq!(config.store.snapshot_format, SnapshotFormat::Bincode);
        assert_eq!(config.output.put_dir, Some(PathBuf::from("puts")));
        assert_eq!(config.generation.build_strategy().unwrap().name(), "seeded-template");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<DugenConfig, _> = toml::from_str("[orchestrator]\nmax-cycle = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = DugenConfig::load_from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn command_engine_requires_settings() {
        assert!(EngineConfig::default().command_engine_config().is_err());
    }

    #[test]
    fn environment_assembly_wins() {
        assert_eq!(resolve_assembly(Some("A"), Some("B")).as_deref(), Some("B"));
        assert_eq!(resolve_assembly(Some("A"), Some("  ")).as_deref(), Some("A"));
        assert_eq!(resolve_assembly(None, None), None);
    }

    #[test]
    fn template_sources_are_exclusive() {
        let dir = tempdir().unwrap();
        let template_path = dir.path().join("put.tmpl");
        fs::write(&template_path, "put {name}").unwrap();

        let from_file = GenerationConfig {
            template_path: Some(template_path.clone()),
            ..GenerationConfig::default()
        };
        assert_eq!(from_file.template_text().unwrap(), "put {name}");
        assert_eq!(from_file.build_strategy().unwrap().name(), "template");

        let both = GenerationConfig {
            template: Some("x".to_string()),
            template_path: Some(template_path),
            ..GenerationConfig::default()
        };
        assert!(both.template_text().is_err());
        assert_eq!(
            GenerationConfig::default().template_text().unwrap(),
            DEFAULT_PUT_TEMPLATE
        );
    }

    #[test]
    fn bad_template_is_reported() {
        let config = GenerationConfig {
            template: Some("put {nope}".to_string()),
            ..GenerationConfig::default()
        };
        let err = config.build_strategy().err().unwrap();
        assert!(err.to_string().contains("Invalid PUT template"));
    }

    #[test]
    fn views_load_with_assembly_check() {
        let dir = tempdir().unwrap();
        let static_path = dir.path().join("static.toml");
        fs::write(
            &static_path,
            "assembly = \"Bank\"\n[[types]]\nname = \"T\"\nfields = [\"T.F\"]\n",
        )
        .unwrap();

        let matching = MetadataConfig {
            assembly: Some("Bank".to_string()),
            static_path: Some(static_path.clone()),
            dynamic_path: None,
        };
        if std::env::var(ASSEMBLY_ENV_VAR).is_err() {
            let views = matching.load_views(ViewPolicy::Static).unwrap();
            assert_eq!(views.policy(), ViewPolicy::Static);

            let other = MetadataConfig {
                assembly: Some("Shop".to_string()),
                ..matching
            };
            assert!(other.load_views(ViewPolicy::Static).is_err());
        }
    }
}
