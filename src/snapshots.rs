use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs as async_fs;

use crate::conversation::Screenshot;

/// Receives every screenshot a turn captures. Failures are logged by the loop, never fatal.
#[async_trait]
pub trait ScreenshotStore: Send + Sync {
    async fn save(&self, turn_id: &str, step: usize, screenshot: &Screenshot) -> Result<()>;
}

/// Writes `<base>/<turn_id>/step_NNN.png`.
pub struct DiskScreenshotStore {
    base_dir: PathBuf,
}

impl DiskScreenshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base_dir: base.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, turn_id: &str, step: usize) -> PathBuf {
        self.base_dir.join(turn_id).join(format!("step_{:03}.png", step))
    }
}

#[async_trait]
impl ScreenshotStore for DiskScreenshotStore {
    async fn save(&self, turn_id: &str, step: usize, screenshot: &Screenshot) -> Result<()> {
        let path = self.path_for(turn_id, step);
        if let Some(dir) = path.parent() {
            async_fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create_dir {}", dir.display()))?;
        }
        async_fs::write(&path, &screenshot.data)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}
