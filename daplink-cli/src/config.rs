use std::path::{Path, PathBuf};

use anyhow::Context;
use daplink::flashing::SequencerOptions;
use daplink_target::Registry;
use figment::providers::{Env, Format as _, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::util::logging::LevelFilter;

/// The configuration file searched for in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "daplink.toml";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `--log-level` is not given. Without either, `RUST_LOG` applies.
    pub log_level: Option<LevelFilter>,
    /// Additional target descriptions, loaded after the built-in boards.
    pub targets: Vec<PathBuf>,
    /// Board used when a command does not name one.
    pub board: Option<String>,
    /// Options of every flashing operation, below the `[flashing]` table.
    pub flashing: SequencerOptions,
}

impl Config {
    /// Merges the defaults, the configuration file and `DAPLINK_*` environment variables.
    ///
    /// Nested keys are separated by a double underscore, e.g. `DAPLINK_FLASHING__VERIFY`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DAPLINK_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load the configuration from {}", path.display()))
    }

    /// The built-in boards plus the configured target descriptions.
    pub fn registry(&self, extra: &[PathBuf]) -> anyhow::Result<Registry> {
        let mut registry = Registry::from_builtin_boards();

        for path in self.targets.iter().chain(extra) {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open target description {}", path.display()))?;
            let name = registry
                .add_target_from_yaml(file)
                .with_context(|| format!("Failed to load target description {}", path.display()))?;
            tracing::info!("Loaded target {} from {}", name, path.display());
        }

        Ok(registry)
    }
}
