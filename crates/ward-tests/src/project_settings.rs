use std::{io::ErrorKind, path::PathBuf};

use eyre::{eyre, Result};
use serde::Deserialize;

const SETTINGS_FILE: &str = "ward-test.toml";

#[derive(Clone, Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectSettings {
    #[serde(skip)]
    #[allow(unused)]
    pub project_root: PathBuf,

    #[serde(default)]
    pub store: StoreBackend,

    #[serde(default = "default_workers")]
    pub workers: u16,
}

/// Store the allocator under test runs on
#[derive(Clone, Copy, PartialEq, Eq, Deserialize, Default, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    #[default]
    Memory,
    /// SQLite, in memory so tests do not share state
    Sqlite,
}

fn default_workers() -> u16 {
    4
}

impl ProjectSettings {
    /// Read `ward-test.toml` from the working directory or one of its
    /// parents, falling back to defaults if there is none
    pub fn load() -> Result<Self> {
        let mut path = std::env::current_dir()?;
        let start = path.clone();
        let found = loop {
            path.push(SETTINGS_FILE);

            match std::fs::read_to_string(&path) {
                Ok(s) => break Some(s),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            path.pop();
            if !path.pop() {
                break None;
            }
        };

        let mut settings = match found {
            Some(contents) => {
                path.pop();
                let mut settings: ProjectSettings = toml::from_str(&contents)?;
                settings.project_root = path;
                settings
            }
            None => ProjectSettings {
                project_root: start,
                store: StoreBackend::default(),
                workers: default_workers(),
            },
        };

        if let Some(v) = std::env::var_os("WARD_TEST_STORE") {
            if v.eq_ignore_ascii_case("memory") {
                settings.store = StoreBackend::Memory;
            } else if v.eq_ignore_ascii_case("sqlite") {
                settings.store = StoreBackend::Sqlite;
            } else {
                return Err(eyre!("WARD_TEST_STORE must be `memory` or `sqlite`"));
            }
        }

        Ok(settings)
    }
}
