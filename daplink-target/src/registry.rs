//! Lookup of the board descriptions known to the flashing engine.

use crate::{TargetConfig, TargetDescriptionSource, TargetValidationError};
use once_cell::sync::Lazy;

/// The board descriptions compiled into the crate.
const BUILTIN_TARGETS: &[(&str, &str)] = &[
    ("gd32f307vg.yaml", include_str!("../targets/gd32f307vg.yaml")),
    ("nrf52840dk.yaml", include_str!("../targets/nrf52840dk.yaml")),
    (
        "nucleo_f412zg.yaml",
        include_str!("../targets/nucleo_f412zg.yaml"),
    ),
];

static BUILTIN_BOARDS: Lazy<Vec<TargetConfig>> = Lazy::new(|| {
    BUILTIN_TARGETS
        .iter()
        .filter_map(|(file, yaml)| match parse_target(yaml.as_bytes()) {
            Ok(mut target) => {
                target.source = TargetDescriptionSource::BuiltIn;
                Some(target)
            }
            Err(error) => {
                tracing::error!("Skipping built-in target {}: {}", file, error);
                None
            }
        })
        .collect()
});

/// Error type for all errors which occur when working
/// with the board registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The requested board was not found in the registry.
    #[error("The requested board '{0}' was not found in the list of known boards.")]
    BoardNotFound(String),
    /// An invalid [`TargetConfig`] was found.
    #[error("Invalid target description {name}")]
    InvalidTargetConfig {
        /// The name of the rejected target.
        name: String,
        /// Why the description was rejected.
        #[source]
        error: TargetValidationError,
    },
    /// An IO error occurred when trying to read a target description file.
    #[error("An IO error was encountered")]
    Io(#[from] std::io::Error),
    /// An error occurred while deserializing a YAML target description file.
    #[error("Deserializing the yaml encountered an error")]
    Yaml(#[from] serde_yaml::Error),
}

fn parse_target<R: std::io::Read>(reader: R) -> Result<TargetConfig, RegistryError> {
    let mut target = TargetConfig::from_yaml_reader(reader)?;
    target.normalize();
    target
        .validate()
        .map_err(|error| RegistryError::InvalidTargetConfig {
            name: target.name.clone(),
            error,
        })?;
    Ok(target)
}

/// Registry of all available boards.
#[derive(Debug, Clone)]
pub struct Registry {
    targets: Vec<TargetConfig>,
}

impl Registry {
    /// A registry without any boards.
    pub fn new() -> Self {
        Self { targets: vec![] }
    }

    /// A registry which contains the boards compiled into the crate.
    pub fn from_builtin_boards() -> Self {
        Self {
            targets: BUILTIN_BOARDS.clone(),
        }
    }

    /// All known boards.
    pub fn targets(&self) -> &[TargetConfig] {
        &self.targets
    }

    /// Looks up a board by its four character id. The comparison ignores ASCII case.
    pub fn get_target_by_board_id(&self, board_id: &str) -> Result<&TargetConfig, RegistryError> {
        self.targets
            .iter()
            .find(|target| target.board_id.eq_ignore_ascii_case(board_id))
            .ok_or_else(|| RegistryError::BoardNotFound(board_id.to_string()))
    }

    /// Looks up a board by name. The comparison ignores ASCII case.
    pub fn get_target_by_name(&self, name: &str) -> Result<&TargetConfig, RegistryError> {
        self.targets
            .iter()
            .find(|target| target.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| RegistryError::BoardNotFound(name.to_string()))
    }

    /// Adds a board from a YAML description.
    ///
    /// A board with the same id is replaced. Returns the name of the added board.
    pub fn add_target_from_yaml<R: std::io::Read>(
        &mut self,
        yaml_reader: R,
    ) -> Result<String, RegistryError> {
        let target = parse_target(yaml_reader)?;
        let name = target.name.clone();

        if let Some(index) = self
            .targets
            .iter()
            .position(|old| old.board_id.eq_ignore_ascii_case(&target.board_id))
        {
            tracing::warn!(
                "Replacing board {} with external description {}",
                self.targets[index].name,
                name
            );
            self.targets.remove(index);
        }
        self.targets.push(target);

        Ok(name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::from_builtin_boards()
    }
}
