//! Spawning children under a broker policy.

use std::io;
use std::os::fd::RawFd;
use std::process::{Command, ExitStatus, Output, Stdio};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::broker::{BootstrapSandbox, ClientRegistry};
use super::policy::PolicyId;

/// A child launched through `spawn_sandboxed`.
///
/// Dropping it kills the process (if still running) and forgets its pid in
/// the broker.
#[derive(Debug)]
pub struct SandboxedChild {
    child: tokio::process::Child,
    pid: libc::pid_t,
    registry: Arc<ClientRegistry>,
    released: bool,
}

/// Free descriptors required below the bootstrap fd when spawning.
///
/// `Command` opens its pipes at the lowest free descriptors; with fewer free
/// slots below the bootstrap fd one of them could land on it and be replaced
/// in the child.
pub const SPAWN_FD_HEADROOM: usize = 8;

/// Spawn `cmd` so that it checks in with `broker` under policy `id` before it
/// execs.
///
/// Fails with `InvalidInput` when the parent has too few free descriptors
/// below the bootstrap fd (see `SPAWN_FD_HEADROOM`).
///
/// Panics if `id` is not registered with `broker`.
pub async fn spawn_sandboxed(
    broker: &BootstrapSandbox,
    id: PolicyId,
    mut cmd: Command,
) -> io::Result<SandboxedChild> {
    let delegate = broker.new_client(id);
    let token = delegate.token();
    let reserved = std::iter::once(delegate.target_fd()).chain(delegate.secondary_fd());
    for fd in reserved {
        if let Err(e) = check_fd_headroom(fd) {
            broker.revoke_token(token);
            return Err(e);
        }
    }
    delegate.install(&mut cmd);

    let mut cmd = tokio::process::Command::from(cmd);
    cmd.kill_on_drop(true);

    // Spawning blocks until the child has checked in and exec'd.
    let spawned = tokio::task::spawn_blocking(move || cmd.spawn())
        .await
        .map_err(io::Error::other)
        .and_then(|result| result);

    let child = match spawned {
        Ok(child) => child,
        Err(e) => {
            broker.revoke_token(token);
            broker.registry().invalidate_token_holder(token);
            return Err(e);
        }
    };

    let Some(pid) = child.id() else {
        broker.revoke_token(token);
        return Err(io::Error::other("sandboxed child exited before it could be tracked"));
    };
    let pid = pid as libc::pid_t;
    // A child that died in its pre-exec hook never checked in.
    broker.revoke_token(token);

    match broker.registry().policy_id_for_process(pid) {
        Some(policy) => debug!("Spawned pid {} under sandbox policy {}", pid, policy),
        None => warn!("Spawned pid {} did not check in", pid),
    }

    Ok(SandboxedChild {
        child,
        pid,
        registry: broker.registry().clone(),
        released: false,
    })
}

impl SandboxedChild {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.release();
        Ok(status)
    }

    /// Wait for exit while collecting any piped stdout and stderr.
    pub async fn wait_with_output(mut self) -> io::Result<Output> {
        let mut stdout = self.child.stdout.take();
        let mut stderr = self.child.stderr.take();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                out.read_to_end(&mut buf).await?;
            }
            Ok::<_, io::Error>(buf)
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                err.read_to_end(&mut buf).await?;
            }
            Ok::<_, io::Error>(buf)
        };

        let (status, stdout, stderr) =
            tokio::try_join!(self.child.wait(), read_stdout, read_stderr)?;
        self.release();
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }

    /// Ask the child to exit with SIGTERM.
    pub fn terminate(&self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(self.pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    fn release(&mut self) {
        if !self.released {
            self.registry.invalidate_client(self.pid);
            self.released = true;
        }
    }
}

impl Drop for SandboxedChild {
    fn drop(&mut self) {
        self.release();
    }
}

fn check_fd_headroom(fd: RawFd) -> io::Result<()> {
    let free = (0..fd.max(0))
        .filter(|&candidate| !fd_is_open(candidate))
        .take(SPAWN_FD_HEADROOM)
        .count();
    if free < SPAWN_FD_HEADROOM {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "descriptor {} is too close to the open descriptors: {} free below it, {} needed",
                fd, free, SPAWN_FD_HEADROOM
            ),
        ));
    }
    Ok(())
}

fn fd_is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only reads descriptor flags.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// Build a command whose stdio is piped for `wait_with_output`.
pub fn piped(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::broker::BrokerOptions;
    use crate::sandbox::namespace::Namespace;
    use crate::sandbox::policy::SandboxPolicy;
    use std::os::unix::process::ExitStatusExt;

    fn broker(tmp: &tempfile::TempDir) -> Arc<BootstrapSandbox> {
        let options = BrokerOptions {
            bundle_id: "l".to_string(),
            ..BrokerOptions::default()
        };
        let broker = BootstrapSandbox::create(options, Namespace::directory(tmp.path())).unwrap();
        broker.register_sandbox_policy(PolicyId(7), SandboxPolicy::deny_all());
        broker
    }

    fn short_tempdir() -> tempfile::TempDir {
        tempfile::Builder::new()
            .prefix("bsl")
            .tempdir_in("/tmp")
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn child_sees_bootstrap_fd() {
        let tmp = short_tempdir();
        let broker = broker(&tmp);

        let mut cmd = piped("sh");
        cmd.arg("-c").arg("echo $BOOTSTRAP_SANDBOX_FD");
        let child = spawn_sandboxed(&broker, PolicyId(7), cmd).await.unwrap();
        let pid = child.pid();
        assert!(broker.policy_for_process(pid).is_some());

        let output = child.wait_with_output().await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "200");
        assert!(broker.policy_for_process(pid).is_none());
        assert_eq!(broker.registry().awaiting_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_spawn_revokes_token() {
        let tmp = short_tempdir();
        let broker = broker(&tmp);

        let cmd = Command::new("/nonexistent/bootstrap-sandbox-test-binary");
        let result = spawn_sandboxed(&broker, PolicyId(7), cmd).await;

        assert!(result.is_err());
        assert_eq!(broker.registry().awaiting_count(), 0);
        assert_eq!(broker.registry().sandboxed_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrap_fd_without_headroom_is_refused() {
        let tmp = short_tempdir();
        let options = BrokerOptions {
            bundle_id: "h".to_string(),
            bootstrap_fd: 5,
            ..BrokerOptions::default()
        };
        let broker = BootstrapSandbox::create(options, Namespace::directory(tmp.path())).unwrap();
        broker.register_sandbox_policy(PolicyId(7), SandboxPolicy::deny_all());

        let err = spawn_sandboxed(&broker, PolicyId(7), Command::new("true"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(broker.registry().awaiting_count(), 0);
        assert_eq!(broker.registry().sandboxed_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn secondary_fd_needs_headroom_too() {
        let tmp = short_tempdir();
        let options = BrokerOptions {
            bundle_id: "s".to_string(),
            secondary_fd: Some(4),
            ..BrokerOptions::default()
        };
        let broker = BootstrapSandbox::create(options, Namespace::directory(tmp.path())).unwrap();
        broker.register_sandbox_policy(PolicyId(7), SandboxPolicy::deny_all());

        let result = spawn_sandboxed(&broker, PolicyId(7), Command::new("true")).await;
        assert!(result.is_err());
        assert_eq!(broker.registry().awaiting_count(), 0);
    }

    #[test]
    fn headroom_counts_free_descriptors_below() {
        assert!(check_fd_headroom(200).is_ok());
        assert!(check_fd_headroom(3).is_err());
        assert!(check_fd_headroom(-1).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminate_and_drop_release_the_pid() {
        let tmp = short_tempdir();
        let broker = broker(&tmp);

        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mut child = spawn_sandboxed(&broker, PolicyId(7), cmd).await.unwrap();
        assert_eq!(broker.registry().sandboxed_count(), 1);

        child.terminate().unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert_eq!(broker.registry().sandboxed_count(), 0);

        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let child = spawn_sandboxed(&broker, PolicyId(7), cmd).await.unwrap();
        drop(child);
        assert_eq!(broker.registry().sandboxed_count(), 0);
    }
}
