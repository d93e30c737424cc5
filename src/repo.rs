use std::path::{Path, PathBuf};

use crate::error::{Result, TallyError};

pub const CONFIG_FILE: &str = "config.json";
pub const LEDGER_FILE: &str = "ledger.beancount";
pub const TRANSACTIONS_DIR: &str = "transactions";
pub const EXTRACTS_DIR: &str = "extracts";

/// The working directory holding config, ledger and extracts.
#[derive(Debug, Clone)]
pub struct Repo {
    root: PathBuf,
}

impl Repo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--repo` if given, else the current directory.
    pub fn resolve(dir: Option<&str>) -> Result<Self> {
        match dir {
            Some(d) => Ok(Self::new(shellexpand_path(d))),
            None => Ok(Self::new(std::env::current_dir()?)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.root.join(TRANSACTIONS_DIR)
    }

    pub fn extracts_dir(&self) -> PathBuf {
        self.root.join(EXTRACTS_DIR)
    }

    /// Fail early with a hint when `init` was never run here.
    pub fn require_initialized(&self) -> Result<()> {
        for path in [self.ledger_path(), self.transactions_dir()] {
            if !path.exists() {
                return Err(TallyError::Other(format!(
                    "{} not found\nRun `tally init` in {} first.",
                    path.display(),
                    self.root.display()
                )));
            }
        }
        Ok(())
    }
}

pub fn shellexpand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path))
}
