use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info};
use serde::Deserialize;

use crate::cache::DEFAULT_STORE_ATTEMPTS;

const APP_DIR: &str = "chapter-panel";

// ---------------------------------------------------------------------------
// ConfigFile: deserialized from TOML (all fields optional)
// ---------------------------------------------------------------------------

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub source: SourceConfigFile,
    #[serde(default)]
    pub audio: AudioConfigFile,
    #[serde(default)]
    pub cache: CacheConfigFile,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct SourceConfigFile {
    pub usfm_dir: Option<PathBuf>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct AudioConfigFile {
    pub dir: Option<PathBuf>,
    pub extensions: Option<Vec<String>>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct CacheConfigFile {
    pub store_attempts: Option<usize>,
}

// ---------------------------------------------------------------------------
// Config: resolved (all fields concrete)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub state_file: PathBuf,
    /// Relative paths resolve against the project directory.
    pub usfm_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub audio_extensions: Vec<String>,
    pub store_attempts: usize,
}

impl Config {
    /// Directory holding `<BOOK>.usfm` files for `project_dir`.
    pub fn usfm_dir_for(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.usfm_dir)
    }
}

/// Values a host may force regardless of the config file.
#[derive(Default, Clone)]
pub struct Overrides {
    pub state_file: Option<PathBuf>,
    pub usfm_dir: Option<PathBuf>,
    pub audio_dir: Option<PathBuf>,
}

impl ConfigFile {
    /// Merge host overrides (overwrites non-None fields).
    pub fn merge_overrides(&mut self, overrides: &Overrides) {
        if let Some(v) = &overrides.state_file {
            debug!("config: override state_file={}", v.display());
            self.state_file = Some(v.clone());
        }
        if let Some(v) = &overrides.usfm_dir {
            debug!("config: override usfm_dir={}", v.display());
            self.source.usfm_dir = Some(v.clone());
        }
        if let Some(v) = &overrides.audio_dir {
            debug!("config: override audio_dir={}", v.display());
            self.audio.dir = Some(v.clone());
        }
    }

    /// Resolve to a Config by applying defaults to missing fields.
    pub fn resolve(self) -> Config {
        let config = Config {
            state_file: self
                .state_file
                .or_else(default_state_file)
                .unwrap_or_else(|| PathBuf::from("state.json")),
            usfm_dir: self.source.usfm_dir.unwrap_or_else(|| "text".into()),
            audio_dir: self.audio.dir.unwrap_or_else(|| "audio".into()),
            audio_extensions: self
                .audio
                .extensions
                .unwrap_or_else(|| vec!["wav".into(), "mp3".into()]),
            store_attempts: self
                .cache
                .store_attempts
                .unwrap_or(DEFAULT_STORE_ATTEMPTS)
                .max(1),
        };
        info!(
            "config: resolved state_file={}, usfm_dir={}, audio_dir={}, \
             audio_extensions={:?}, store_attempts={}",
            config.state_file.display(),
            config.usfm_dir.display(),
            config.audio_dir.display(),
            config.audio_extensions,
            config.store_attempts,
        );
        config
    }
}

fn xdg_dir(var: &str, fallback: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(fallback)))
}

fn default_state_file() -> Option<PathBuf> {
    Some(xdg_dir("XDG_DATA_HOME", ".local/share")?.join(APP_DIR).join("state.json"))
}

/// Resolve the XDG config path.
fn config_path() -> Option<PathBuf> {
    Some(xdg_dir("XDG_CONFIG_HOME", ".config")?.join(APP_DIR).join("config.toml"))
}

/// Read `config.toml` from the XDG config directory. A missing file (or no
/// home directory at all) yields the defaults; a file that does not parse is
/// an error rather than silently ignored.
pub fn load_config() -> anyhow::Result<ConfigFile> {
    let Some(path) = config_path() else {
        info!("config: no HOME or XDG_CONFIG_HOME, panel runs on defaults");
        return Ok(ConfigFile::default());
    };
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> anyhow::Result<ConfigFile> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("config: nothing at {}, panel runs on defaults", path.display());
            return Ok(ConfigFile::default());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("cannot read panel config {}", path.display()));
        }
    };
    let config = toml::from_str(&text)
        .with_context(|| format!("{} is not a valid chapter-panel config", path.display()))?;
    info!("config: using {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml() {
        let cfg: ConfigFile = toml::from_str("").unwrap();
        let resolved = cfg.resolve();
        assert_eq!(resolved.usfm_dir, PathBuf::from("text"));
        assert_eq!(resolved.audio_dir, PathBuf::from("audio"));
        assert_eq!(resolved.audio_extensions, ["wav", "mp3"]);
        assert_eq!(resolved.store_attempts, DEFAULT_STORE_ATTEMPTS);
        assert!(resolved.state_file.ends_with("state.json"));
    }

    #[test]
    fn partial_toml() {
        let text = r#"
            state_file = "/var/lib/panel/state.json"
            [audio]
            extensions = ["flac"]
            [cache]
            store_attempts = 0
        "#;
        let cfg: ConfigFile = toml::from_str(text).unwrap();
        let resolved = cfg.resolve();
        assert_eq!(resolved.state_file, PathBuf::from("/var/lib/panel/state.json"));
        assert_eq!(resolved.audio_extensions, ["flac"]);
        assert_eq!(resolved.store_attempts, 1);
        // Defaults for unspecified fields
        assert_eq!(resolved.audio_dir, PathBuf::from("audio"));
    }

    #[test]
    fn mistyped_field_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nstore_attempts = \"many\"\n").unwrap();
        let err = load_config_from(&path).err().unwrap();
        let message = format!("{err:#}");
        assert!(message.contains("config.toml"));
        assert!(message.contains("not a valid chapter-panel config"));
    }

    #[test]
    fn overrides_win() {
        let mut cfg: ConfigFile = toml::from_str("[audio]\ndir = \"rec\"").unwrap();
        cfg.merge_overrides(&Overrides {
            audio_dir: Some("takes".into()),
            ..Overrides::default()
        });
        let resolved = cfg.resolve();
        assert_eq!(resolved.audio_dir, PathBuf::from("takes"));
        assert_eq!(resolved.usfm_dir_for(Path::new("/proj")), PathBuf::from("/proj/text"));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert!(cfg.state_file.is_none());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[[[").unwrap();
        assert!(load_config_from(&bad).is_err());
    }
}
