use crate::core::error::UnitError;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Streams an output into `<target>.partial` and renames it into place on
/// commit. Dropped without commit, the partial file is removed.
pub struct Assembler {
    file: Option<File>,
    partial_path: PathBuf,
    target_path: PathBuf,
    written: u64,
}

pub fn partial_path_for(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

impl Assembler {
    pub async fn create(target: &Path) -> std::io::Result<Self> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial_path = partial_path_for(target);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&partial_path)
            .await?;
        Ok(Self { file: Some(file), partial_path, target_path: target.to_path_buf(), written: 0 })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// Starts over, e.g. when a retried request replays the body from byte 0.
    pub async fn reset(&mut self) -> std::io::Result<()> {
        if let Some(f) = self.file.as_mut() {
            f.set_len(0).await?;
            f.seek(std::io::SeekFrom::Start(0)).await?;
        }
        self.written = 0;
        Ok(())
    }

    /// Fails when writing `incoming` more bytes would leave less than
    /// `reserve` free. A volume that cannot be queried is assumed to fit.
    pub fn ensure_space(&self, incoming: u64, reserve: u64) -> Result<(), UnitError> {
        let dir = self.partial_path.parent().unwrap_or_else(|| Path::new("."));
        let available = match fs2::available_space(dir) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "free space unknown");
                return Ok(());
            }
        };
        let required = incoming.saturating_add(reserve);
        if available < required {
            tracing::error!(dir = %dir.display(), required, available, "not enough free space");
            return Err(UnitError::InsufficientSpace { required, available });
        }
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let f = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "assembler already closed"))?;
        f.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub async fn commit(mut self) -> std::io::Result<PathBuf> {
        if let Some(mut f) = self.file.take() {
            f.flush().await?;
            f.sync_all().await?;
        }
        if tokio::fs::metadata(&self.target_path).await.is_ok() {
            tokio::fs::remove_file(&self.target_path).await?;
        }
        tokio::fs::rename(&self.partial_path, &self.target_path).await?;
        Ok(self.target_path.clone())
    }

    pub async fn discard(mut self) {
        self.file.take();
        let _ = tokio::fs::remove_file(&self.partial_path).await;
    }
}

impl Drop for Assembler {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.partial_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_moves_partial_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out/clip.mp4");
        let mut a = Assembler::create(&target).await.unwrap();
        assert!(dir.path().join("out/clip.mp4.partial").exists());
        a.write(b"abc").await.unwrap();
        a.write(b"def").await.unwrap();
        assert_eq!(a.written(), 6);
        let path = a.commit().await.unwrap();
        assert_eq!(path, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"abcdef");
        assert!(!dir.path().join("out/clip.mp4.partial").exists());
    }

    #[tokio::test]
    async fn dropping_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.bin");
        {
            let mut a = Assembler::create(&target).await.unwrap();
            a.write(b"x").await.unwrap();
        }
        assert!(!partial_path_for(&target).exists());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn reset_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.bin");
        let mut a = Assembler::create(&target).await.unwrap();
        a.write(b"garbage").await.unwrap();
        a.reset().await.unwrap();
        a.write(b"ok").await.unwrap();
        a.commit().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"ok");
    }
}
