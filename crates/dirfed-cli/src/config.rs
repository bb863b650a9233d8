//! Console configuration

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use dirfed_core::{JsonFileConfig, ProviderConfig, ProviderConfigDetails};

#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Providers in registration order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_directory_file() -> PathBuf {
    PathBuf::from("data/directory.json")
}

impl Settings {
    /// Load settings from `config/default`, `config/local`, an optional extra
    /// file, then `DIRFED__*` environment variables.
    pub fn load(extra: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        if let Some(path) = extra {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("DIRFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        if settings.providers.is_empty() {
            return Ok(Self::default());
        }
        Ok(settings)
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

impl Default for Settings {
    /// A single JSON file directory in the working directory
    fn default() -> Self {
        Self {
            providers: vec![ProviderConfig {
                enabled: true,
                details: ProviderConfigDetails::JsonFile(JsonFileConfig::new(
                    default_directory_file(),
                )),
            }],
        }
    }
}
