//! Process-wide playback preferences, persisted as a TOML file.

use crate::error::{PlaybackError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const PREFS_FILE: &str = "playback.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Values {
    #[serde(default)]
    playback_key_transposition: i8,
}

/// Persistent playback preferences.
///
/// Loading is lenient: a missing or unreadable file yields defaults, a write
/// failure is logged and the in-memory value kept. Value validation is strict.
#[derive(Debug)]
pub struct Preferences {
    path: PathBuf,
    values: Values,
}

impl Preferences {
    /// Open the per-user preference file in the platform config directory.
    pub fn open() -> Self {
        let path = directories::ProjectDirs::from("org", "bandstand", "bandstand")
            .map(|dirs| dirs.config_dir().join(PREFS_FILE))
            .unwrap_or_else(|| PathBuf::from(PREFS_FILE));
        Self::with_path(path)
    }

    /// Open a preference file at an explicit path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = load_values(&path);
        Self { path, values }
    }

    /// Key transposition applied to generated music, in `[-11, 0]` semitones.
    pub fn key_transposition(&self) -> i8 {
        self.values.playback_key_transposition
    }

    /// Set and persist the key transposition. `t` must be in `[-11, 0]`.
    pub fn set_key_transposition(&mut self, t: i8) -> Result<()> {
        if !(-11..=0).contains(&t) {
            return Err(PlaybackError::InvalidParameter(format!(
                "key transposition {t} not in [-11, 0]"
            )));
        }
        self.values.playback_key_transposition = t;
        self.save();
        Ok(())
    }

    fn save(&self) {
        let text = match toml::to_string_pretty(&self.values) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("could not serialize preferences: {e}");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                log::warn!("could not create preference directory: {e}");
                return;
            }
        }
        if let Err(e) = fs::write(&self.path, text) {
            log::warn!("could not write {}: {e}", self.path.display());
        }
    }
}

fn load_values(path: &Path) -> Values {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return Values::default(),
    };
    match toml::from_str(&text) {
        Ok(values) => values,
        Err(e) => {
            log::warn!("ignoring malformed {}: {e}", path.display());
            Values::default()
        }
    }
}
