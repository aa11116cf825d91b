use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use deblur_artifacts::FsResultCommitter;
use deblur_storage::{CachedTaskStore, TaskStore};
use deblur_storage_sqlite::SqliteTaskStore;
use tracing::{info, warn};

use crate::{BatchRunner, Config, HttpImageEditor, ImageEditor, RecoveryScanner, RunnerSettings};

/// Everything a working root needs: config, durable store, runner and recovery.
pub struct Deblur {
    pub root: PathBuf,
    pub cfg: Config,
    pub store: Arc<dyn TaskStore>,
    pub runner: BatchRunner,
    pub scanner: RecoveryScanner,
}

impl Deblur {
    pub fn open(root: PathBuf) -> Result<Self> {
        let cfg = Config::load_or_init(&root)?;
        let api_key = cfg.api_key();
        if api_key.is_none() {
            warn!(env = %cfg.editor.api_key_env, "no editor API key set");
        }
        let editor: Arc<dyn ImageEditor> = Arc::new(HttpImageEditor::new(
            cfg.editor.endpoint.clone(),
            cfg.edit.model.clone(),
            api_key,
            cfg.editor_timeout(),
        ));
        Self::open_with_editor(root, cfg, editor)
    }

    /// Same as `open` but with a caller-supplied editor.
    pub fn open_with_editor(root: PathBuf, cfg: Config, editor: Arc<dyn ImageEditor>) -> Result<Self> {
        let db_path = cfg.db_path(&root);
        let sqlite = SqliteTaskStore::open(&db_path).with_context(|| format!("open task store {}", db_path.display()))?;
        let store: Arc<dyn TaskStore> = Arc::new(CachedTaskStore::new(sqlite));

        let runner = BatchRunner::new(
            store.clone(),
            editor,
            Arc::new(FsResultCommitter::new()),
            RunnerSettings {
                heartbeat_interval: cfg.heartbeat_interval(),
            },
        );
        let scanner = RecoveryScanner::new(store.clone(), cfg.worker.stale_timeout_secs);

        Ok(Self {
            root,
            cfg,
            store,
            runner,
            scanner,
        })
    }

    /// Writes the default config and creates the database.
    pub fn init(root: &Path) -> Result<PathBuf> {
        let cfg = Config::load_or_init(root)?;
        let db_path = cfg.db_path(root);
        SqliteTaskStore::open(&db_path).with_context(|| format!("create task store {}", db_path.display()))?;
        info!(root = %root.display(), db = %db_path.display(), "initialized");
        Ok(Config::config_path(root))
    }
}
