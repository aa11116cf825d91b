use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::editor::{EditOptions, TargetSize};

pub const DEFAULT_PROMPT: &str = "Bring the whole picture into full depth of field: make every blurred or \
                                  defocused area sharp and keep edges crisp.";
pub const DEFAULT_MODEL: &str = "gpt-image-1.5";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub edit: EditConfig,
    pub editor: EditorConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Overrides `.deblur/deblur.db` under the working root.
    #[serde(default)]
    pub db_path: Option<String>,
    /// Parent of default output folders; `~` is expanded.
    pub output_root: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub heartbeat_interval_secs: u64,
    pub stale_timeout_secs: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EditConfig {
    pub prompt: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub output_suffix: String,
    pub output_extension: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EditorConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
    pub api_key_env: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                db_path: None,
                output_root: "~/.deblur/output".to_string(),
            },
            worker: WorkerConfig {
                heartbeat_interval_secs: 10,
                stale_timeout_secs: 60,
            },
            edit: EditConfig {
                prompt: DEFAULT_PROMPT.to_string(),
                model: DEFAULT_MODEL.to_string(),
                width: 1024,
                height: 1536,
                output_suffix: "_clear".to_string(),
                output_extension: "jpg".to_string(),
            },
            editor: EditorConfig {
                endpoint: "http://127.0.0.1:8000/v1/images/edits".to_string(),
                timeout_secs: 300,
                api_key_env: "DEBLUR_API_KEY".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse deblur.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Loads the root's config, writing the defaults first if there is none.
    pub fn load_or_init(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        if path.exists() {
            return Self::load_from(&path);
        }
        let cfg = Self::default();
        cfg.save_to(&path)?;
        Ok(cfg)
    }

    pub fn config_path(root: &Path) -> PathBuf {
        root.join(".deblur").join("deblur.toml")
    }

    pub fn db_path(&self, root: &Path) -> PathBuf {
        match &self.store.db_path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
            None => root.join(".deblur").join("deblur.db"),
        }
    }

    /// Where results for `input` go when no output folder is given.
    pub fn default_output_for(&self, input: &Path) -> PathBuf {
        let root = PathBuf::from(shellexpand::tilde(&self.store.output_root).to_string());
        let name = input
            .file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), self.edit.output_suffix))
            .unwrap_or_else(|| "output".to_string());
        root.join(name)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.worker.heartbeat_interval_secs.max(1))
    }

    pub fn editor_timeout(&self) -> Duration {
        Duration::from_secs(self.editor.timeout_secs)
    }

    /// API key from the configured environment variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.editor.api_key_env).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn edit_options(&self) -> EditOptions {
        EditOptions {
            prompt: self.edit.prompt.clone(),
            model: self.edit.model.clone(),
            target: TargetSize::new(self.edit.width, self.edit.height),
            output_suffix: self.edit.output_suffix.clone(),
            output_extension: self.edit.output_extension.clone(),
        }
    }
}
