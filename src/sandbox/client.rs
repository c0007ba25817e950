use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use super::pre_exec::BOOTSTRAP_FD_ENV;
use super::wire::{self, LookUpReply, LookUpRequest, LookUpStatus, WireError};

#[derive(Debug, thiserror::Error)]
pub enum LookUpError {
    #[error("BOOTSTRAP_SANDBOX_FD is not set; not running under a bootstrap sandbox")]
    NotSandboxed,

    #[error("BOOTSTRAP_SANDBOX_FD='{0}' does not name an open socket")]
    BadDescriptor(String),

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("lookup of '{0}' is not permitted by the sandbox policy")]
    NotPermitted(String),

    #[error("sandbox rejected the lookup of '{0}' as malformed")]
    Malformed(String),

    #[error("lookup reply for '{0}' carried no port")]
    MissingPort(String),

    #[error("bootstrap protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("bootstrap port I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Lookup side of a sandboxed process's replacement bootstrap port.
#[derive(Debug)]
pub struct BootstrapClient {
    stream: UnixStream,
}

impl BootstrapClient {
    /// Adopt the bootstrap port installed by the pre-exec hook.
    ///
    /// Takes ownership of the descriptor named by `BOOTSTRAP_SANDBOX_FD`, so
    /// call it at most once per process.
    pub fn from_env() -> Result<Self, LookUpError> {
        Self::from_env_with(|key| std::env::var(key))
    }

    pub fn from_env_with<F>(env_fn: F) -> Result<Self, LookUpError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let value = env_fn(BOOTSTRAP_FD_ENV).map_err(|_| LookUpError::NotSandboxed)?;
        let fd: RawFd = value
            .trim()
            .parse()
            .map_err(|_| LookUpError::BadDescriptor(value.clone()))?;
        if fd < 0 || !is_socket(fd) {
            return Err(LookUpError::BadDescriptor(value));
        }
        // SAFETY: the descriptor is open and was installed for this process.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_fd(owned))
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            stream: UnixStream::from(fd),
        }
    }

    /// Look up `name` through the sandbox, returning the granted port.
    pub fn look_up(&mut self, name: &str) -> Result<OwnedFd, LookUpError> {
        let request = LookUpRequest {
            name: name.to_string(),
        }
        .encode()?;
        self.stream.write_all(&request)?;

        let mut buf = [0u8; LookUpReply::LEN];
        let (n, port) = wire::recv_with_fd(self.stream.as_fd(), &mut buf)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        if n < buf.len() {
            self.stream.read_exact(&mut buf[n..])?;
        }

        match LookUpReply::decode(&buf)?.status {
            LookUpStatus::Ok => port.ok_or_else(|| LookUpError::MissingPort(name.to_string())),
            LookUpStatus::UnknownService => Err(LookUpError::UnknownService(name.to_string())),
            LookUpStatus::NotPermitted => Err(LookUpError::NotPermitted(name.to_string())),
            LookUpStatus::Malformed => Err(LookUpError::Malformed(name.to_string())),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

fn is_socket(fd: RawFd) -> bool {
    // SAFETY: fstat only writes into the provided struct.
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        libc::fstat(fd, &mut st) == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
    }
}
