use crate::acq_values::DEPRECATED;
use crate::error::{PslError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    /// Characterization in its text form, if one was saved with the defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characterization: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

impl Defaults {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefaultsStore {
    sections: BTreeMap<String, Defaults>,
}

impl DefaultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let mut store: Self = toml::from_str(text).map_err(|e| PslError::BadDefaults(e.to_string()))?;
        for (alias, section) in store.sections.iter_mut() {
            for name in DEPRECATED {
                if section.values.remove(*name).is_some() {
                    warn!("defaults '{alias}': ignoring deprecated value '{name}'");
                }
            }
        }
        Ok(store)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PslError::BadDefaults(e.to_string()))
    }

    /// Load a store; a missing file yields an empty one.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                debug!("loading defaults from {}", path.display());
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no defaults at {}; starting empty", path.display());
                Ok(Self::new())
            }
            Err(source) => Err(PslError::FileRead {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_toml()?)
    }

    pub fn section(&self, alias: &str) -> Option<&Defaults> {
        self.sections.get(alias)
    }

    pub fn section_mut(&mut self, alias: &str) -> &mut Defaults {
        self.sections.entry(alias.to_string()).or_default()
    }

    pub fn get(&self, alias: &str, name: &str) -> Option<f64> {
        self.section(alias).and_then(|d| d.get(name))
    }

    pub fn set(&mut self, alias: &str, name: &str, value: f64) {
        self.section_mut(alias).set(name, value);
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }
}

/// Replace `path` with `contents` via a temporary file and a rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let write_err = |source| PslError::FileWrite {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, contents).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}
