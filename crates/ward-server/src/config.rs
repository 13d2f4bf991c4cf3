//! Settings file and environment overrides

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use ward_core::Config;

/// Name of the settings file searched from the working directory upwards
pub const SETTINGS_FILE: &str = "ward.toml";

#[derive(Clone, Deserialize, Debug, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub allocator: Config,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Number of threads accepting HTTP requests
    pub workers: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 8585,
            workers: 8,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is not set
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: String::from("info"),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the nearest [`SETTINGS_FILE`] if no
    /// path is given
    ///
    /// Missing settings files are not an error; defaults are used instead.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let contents = match path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("could not read {}", path.display()))?,
            ),
            None => find_settings_file()?,
        };

        let mut settings = match contents {
            Some(contents) => toml::from_str(&contents)?,
            None => Settings::default(),
        };
        settings.apply_env()?;
        Ok(settings)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = std::env::var_os("WARD_DATABASE") {
            self.allocator.database = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        if let Ok(v) = std::env::var("WARD_RETURN_SECS") {
            self.allocator.ambulance_return_secs = v
                .parse()
                .map_err(|_| eyre!("WARD_RETURN_SECS takes a decimal u32, got `{v}`"))?;
        }
        if let Ok(v) = std::env::var("WARD_LOG") {
            self.logging.filter = v;
        }
        Ok(())
    }
}

fn find_settings_file() -> Result<Option<String>> {
    let mut path = std::env::current_dir()?;
    loop {
        path.push(SETTINGS_FILE);

        match std::fs::read_to_string(&path) {
            Ok(s) => return Ok(Some(s)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        path.pop();
        if !path.pop() {
            return Ok(None);
        }
    }
}
