//! Remote liveness via the sentinel pipe.
//!
//! The remote opens the sentinel for writing at startup and never writes to
//! it. The kernel closes that write end however the remote goes away (clean
//! exit, crash, SIGKILL), and the read end then reports EOF. The controller
//! races [`Sentinel::closed`] against every wait.

use std::io;
use std::path::Path;

use tokio::net::unix::pipe;

pub struct Sentinel {
    rx: pipe::Receiver,
}

impl Sentinel {
    /// Open the read end without blocking.
    ///
    /// Must happen before the remote is spawned so its blocking open-for-write
    /// finds a reader.
    pub fn open(path: &Path) -> io::Result<Self> {
        let rx = pipe::OpenOptions::new().open_receiver(path)?;
        Ok(Self { rx })
    }

    /// Resolves once the remote's write end is gone.
    ///
    /// Before any writer has connected a FIFO reports no hangup, so this only
    /// means "remote dead" once the handshake has shown the remote connected.
    /// Cancel safe.
    pub async fn closed(&self) -> io::Result<()> {
        let mut scratch = [0u8; 64];
        loop {
            self.rx.readable().await?;
            match self.rx.try_read(&mut scratch) {
                Ok(0) => return Ok(()),
                // Nothing is ever supposed to be written here.
                Ok(n) => tracing::trace!(bytes = n, "Discarding stray sentinel bytes"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-blocking check for a closed write end.
    pub fn is_closed_now(&self) -> bool {
        let mut scratch = [0u8; 64];
        loop {
            match self.rx.try_read(&mut scratch) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fifo(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("sentinel");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRWXU).unwrap();
        path
    }

    #[tokio::test]
    async fn closed_fires_when_writer_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo(&dir);
        let sentinel = Sentinel::open(&path).unwrap();

        let writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        assert!(!sentinel.is_closed_now());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sentinel.closed())
                .await
                .is_err()
        );

        drop(writer);
        tokio::time::timeout(Duration::from_secs(5), sentinel.closed())
            .await
            .expect("sentinel should report closure")
            .unwrap();
        assert!(sentinel.is_closed_now());
    }

    #[tokio::test]
    async fn stray_bytes_are_ignored() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = fifo(&dir);
        let sentinel = Sentinel::open(&path).unwrap();

        let mut writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(b"noise").unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sentinel.closed())
                .await
                .is_err()
        );

        drop(writer);
        tokio::time::timeout(Duration::from_secs(5), sentinel.closed())
            .await
            .expect("sentinel should report closure")
            .unwrap();
    }
}
