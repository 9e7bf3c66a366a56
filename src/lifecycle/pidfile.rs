//! PID file handling. Grounded in the teacher's `process_manager::PidFile`,
//! narrowed to the single-process-per-project shape this daemon needs: one
//! well-known path under the project's socket directory, `pid:epoch_ms`
//! content, removed on clean exit.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::Result;

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PidFile { path: path.into() }
    }

    pub fn write_current(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = format!("{}:{}\n", std::process::id(), Utc::now().timestamp_millis());
        fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn cleanup(&self) {
        let _ = fs::remove_file(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn write_then_cleanup_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = PidFile::new(dir.path().join("daemon.pid"));
        pid_file.write_current().expect("write");
        let content = fs::read_to_string(pid_file.path()).expect("read");
        assert!(content.contains(&std::process::id().to_string()));
        pid_file.cleanup();
        assert!(!pid_file.path().exists());
    }
}
