use super::TunnelError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a graceful stop waits between the terminate signal and the
/// hard kill.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Seam over the tunnel binary. The monitor drives recovery through this
/// trait; tests script process behavior.
pub trait TunnelProcess: Send + Sync {
    fn spawn(&self) -> Result<(), TunnelError>;
    fn is_running(&self) -> bool;
    /// Sends the terminate signal without waiting.
    fn terminate(&self) -> Result<(), TunnelError>;
    fn kill(&self) -> Result<(), TunnelError>;
    /// Asks the process to reload its configuration. Returns false when
    /// the binary does not support in-place reload; the caller then falls
    /// back to a restart.
    fn reload(&self) -> Result<bool, TunnelError>;
}

/// Waits for the process to exit after a terminate signal, killing it
/// once the grace period runs out.
pub async fn stop_gracefully(process: &dyn TunnelProcess) -> Result<(), TunnelError> {
    if !process.is_running() {
        return Ok(());
    }
    process.terminate()?;

    let deadline = tokio::time::Instant::now() + GRACEFUL_STOP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if !process.is_running() {
            debug!("tunnel process exited gracefully");
            return Ok(());
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    warn!("tunnel process ignored terminate signal, killing");
    process.kill()
}

/// The real tunnel binary, spawned and signalled by pid.
pub struct CloudflaredProcess {
    binary: String,
    config_file: PathBuf,
    child: Mutex<Option<Child>>,
}

impl CloudflaredProcess {
    pub fn new(binary: String, config_file: PathBuf) -> Self {
        Self {
            binary,
            config_file,
            child: Mutex::new(None),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .expect("failed to acquire the lock")
            .as_ref()
            .map(|child| child.id())
    }

    #[cfg(target_family = "unix")]
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), TunnelError> {
        let pid = self.pid().ok_or(TunnelError::NotRunning)?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
            .map_err(|err| TunnelError::Signal(err.to_string()))
    }
}

impl TunnelProcess for CloudflaredProcess {
    fn spawn(&self) -> Result<(), TunnelError> {
        let mut guard = self.child.lock().expect("failed to acquire the lock");
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }

        let child = Command::new(&self.binary)
            .arg("tunnel")
            .arg("--config")
            .arg(&self.config_file)
            .arg("run")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| TunnelError::Spawn(err.to_string()))?;

        info!(binary = %self.binary, pid = child.id(), "tunnel process started");
        *guard = Some(child);
        Ok(())
    }

    fn is_running(&self) -> bool {
        let mut guard = self.child.lock().expect("failed to acquire the lock");
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    #[cfg(target_family = "unix")]
    fn terminate(&self) -> Result<(), TunnelError> {
        self.signal(nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(target_family = "unix")]
    fn kill(&self) -> Result<(), TunnelError> {
        let mut guard = self.child.lock().expect("failed to acquire the lock");
        match guard.as_mut() {
            Some(child) => {
                child
                    .kill()
                    .map_err(|err| TunnelError::Signal(err.to_string()))?;
                let _ = child.wait();
                Ok(())
            }
            None => Err(TunnelError::NotRunning),
        }
    }

    /// cloudflared picks up ingress changes on SIGHUP.
    #[cfg(target_family = "unix")]
    fn reload(&self) -> Result<bool, TunnelError> {
        self.signal(nix::sys::signal::Signal::SIGHUP)?;
        Ok(true)
    }

    #[cfg(not(target_family = "unix"))]
    fn terminate(&self) -> Result<(), TunnelError> {
        self.kill()
    }

    #[cfg(not(target_family = "unix"))]
    fn kill(&self) -> Result<(), TunnelError> {
        Err(TunnelError::Signal("unsupported platform".to_string()))
    }

    #[cfg(not(target_family = "unix"))]
    fn reload(&self) -> Result<bool, TunnelError> {
        Ok(false)
    }
}
