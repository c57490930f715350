use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Outcome of looking for a `.env` file, kept until logging is up.
#[derive(Debug)]
pub enum DotenvOutcome {
    Loaded(PathBuf),
    NotFound,
    Failed(String),
}

/// Load `.env` from the working directory or one of its parents. Variables
/// already present in the environment win.
pub fn load_dotenv() -> DotenvOutcome {
    match dotenv::dotenv() {
        Ok(path) => DotenvOutcome::Loaded(path),
        Err(e) if e.not_found() => DotenvOutcome::NotFound,
        Err(e) => DotenvOutcome::Failed(e.to_string()),
    }
}

/// Load a specific env file.
pub fn load_dotenv_from(path: &Path) -> DotenvOutcome {
    match dotenv::from_path(path) {
        Ok(()) => DotenvOutcome::Loaded(path.to_path_buf()),
        Err(e) if e.not_found() => DotenvOutcome::NotFound,
        Err(e) => DotenvOutcome::Failed(e.to_string()),
    }
}

impl DotenvOutcome {
    pub fn log(&self) {
        match self {
            Self::Loaded(path) => info!("loaded environment from {}", path.display()),
            Self::NotFound => debug!("no .env file found, using process environment"),
            Self::Failed(e) => tracing::warn!("failed to load .env file: {e}"),
        }
    }
}
