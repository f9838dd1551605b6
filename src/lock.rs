use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Pid-file lock guarding against a second runner on the same work dir.
///
/// The file is removed when the guard drops, which covers both normal
/// returns and panics that unwind through `main`.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// Take the lock, waiting for a live holder to go away.
    ///
    /// A lock left behind by a dead process is reclaimed without waiting.
    pub async fn acquire(path: &Path, poll: Duration) -> io::Result<Self> {
        let own_pid = std::process::id();
        let mut announced_wait = false;

        loop {
            match Self::try_create(path, own_pid) {
                Ok(lock) => {
                    if announced_wait {
                        info!("Previous runner exited, lock acquired");
                    }
                    return Ok(lock);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            match read_holder(path) {
                Some(holder) if holder != own_pid && is_process_alive(holder) => {
                    if !announced_wait {
                        info!(
                            "Another runner is active (pid={}), waiting for it to exit",
                            holder
                        );
                        announced_wait = true;
                    }
                    tokio::time::sleep(poll).await;
                }
                holder => {
                    warn!(
                        "Stale lock found at {} (pid={:?}), removing",
                        path.display(),
                        holder
                    );
                    reclaim_stale(path, holder, own_pid)?;
                }
            }
        }
    }

    fn try_create(path: &Path, pid: u32) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        writeln!(file, "{}", pid)?;
        file.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Only remove the file if it still names us.
        if read_holder(&self.path) == Some(self.pid) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to remove lock {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Move a stale lock aside and delete it, unless another starter replaced
/// it after we read `seen`. In that case the new lock is linked back.
fn reclaim_stale(path: &Path, seen: Option<u32>, own_pid: u32) -> io::Result<()> {
    let aside = path.with_extension(format!("stale.{}", own_pid));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    if read_holder(&aside) != seen {
        match fs::hard_link(&aside, path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                let _ = fs::remove_file(&aside);
                return Err(e);
            }
        }
    }
    fs::remove_file(&aside)
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}

/// Signal-0 probe. EPERM means the process exists under another user.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Instant;

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("reap true");
        pid
    }

    #[tokio::test]
    async fn acquires_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.lock");

        {
            let lock = InstanceLock::acquire(&path, Duration::from_secs(30))
                .await
                .unwrap();
            let content = fs::read_to_string(&path).unwrap();
            assert_eq!(content.trim(), lock.pid().to_string());
        }

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.lock");
        fs::write(&path, format!("{}\n", dead_pid())).unwrap();

        let started = Instant::now();
        let lock = InstanceLock::acquire(&path, Duration::from_secs(30))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            lock.pid().to_string()
        );
    }

    #[tokio::test]
    async fn garbage_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.lock");
        fs::write(&path, "not a pid").unwrap();

        let lock = InstanceLock::acquire(&path, Duration::from_secs(30)).await;
        assert!(lock.is_ok());
    }

    #[tokio::test]
    async fn waits_for_live_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.lock");

        let mut holder = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        fs::write(&path, format!("{}\n", holder.id())).unwrap();

        let waiter = {
            let path = path.clone();
            tokio::spawn(async move {
                InstanceLock::acquire(&path, Duration::from_millis(20)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());

        holder.kill().unwrap();
        holder.wait().unwrap();

        let lock = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("lock acquired after holder exit")
            .unwrap()
            .unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            lock.pid().to_string()
        );
    }

    #[test]
    fn reclaim_removes_the_lock_it_inspected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.lock");
        let stale = dead_pid();
        fs::write(&path, format!("{}\n", stale)).unwrap();

        reclaim_stale(&path, Some(stale), 7).unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn reclaim_keeps_a_lock_taken_after_the_stale_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.lock");
        let winner = std::process::id();
        fs::write(&path, format!("{}\n", winner)).unwrap();

        reclaim_stale(&path, Some(dead_pid()), 7).unwrap();
        assert_eq!(read_holder(&path), Some(winner));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
    }
}
