//! Launch-time hook that swaps a child's bootstrap port for the broker's.
//!
//! Everything the hook needs is built in the parent by `PreExecDelegate::new`:
//! the broker's socket address, the encoded check-in request and the target
//! descriptor numbers. `run_async_safe` then runs in the forked child and
//! limits itself to raw syscalls on those buffers and stack memory: no heap
//! allocation, no locks, no logging.

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::process::Command;

use super::namespace::{sun_path_capacity, NamespaceError, ServiceAddress};
use super::wire::{self, CheckInReply, CheckInRequest};

/// Env var naming the inherited descriptor that carries the bootstrap port.
pub const BOOTSTRAP_FD_ENV: &str = "BOOTSTRAP_SANDBOX_FD";

/// Env var naming the secondary copy of the bootstrap port, when stashed.
pub const SECONDARY_FD_ENV: &str = "BOOTSTRAP_SANDBOX_SECONDARY_FD";

/// Descriptor number the bootstrap port is installed at unless configured.
pub const DEFAULT_BOOTSTRAP_FD: RawFd = 200;

/// How the hook reaches the broker's check-in port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// Connect to a socket file.
    Filesystem,
    /// Connect to a Linux abstract socket name.
    #[cfg(target_os = "linux")]
    Abstract,
}

/// A `sockaddr_un` built ahead of `fork`.
#[derive(Clone, Copy)]
pub struct RawSocketAddr {
    addr: libc::sockaddr_un,
    len: libc::socklen_t,
    strategy: LookupStrategy,
}

impl RawSocketAddr {
    pub fn new(address: &ServiceAddress) -> Result<Self, NamespaceError> {
        let (bytes, offset, strategy): (&[u8], usize, LookupStrategy) = match address {
            ServiceAddress::Path(path) => (path.as_os_str().as_bytes(), 0, LookupStrategy::Filesystem),
            #[cfg(target_os = "linux")]
            ServiceAddress::Abstract(name) => (name.as_slice(), 1, LookupStrategy::Abstract),
        };
        if offset + bytes.len() >= sun_path_capacity() {
            return Err(NamespaceError::AddressTooLong(address.to_string()));
        }

        // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (i, b) in bytes.iter().enumerate() {
            addr.sun_path[offset + i] = *b as libc::c_char;
        }

        let base = std::mem::offset_of!(libc::sockaddr_un, sun_path);
        let len = match strategy {
            // Include the terminating NUL.
            LookupStrategy::Filesystem => base + bytes.len() + 1,
            #[cfg(target_os = "linux")]
            LookupStrategy::Abstract => base + offset + bytes.len(),
        };

        #[cfg(any(
            target_vendor = "apple",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            addr.sun_len = len as u8;
        }

        Ok(Self {
            addr,
            len: len as libc::socklen_t,
            strategy,
        })
    }

    pub fn strategy(&self) -> LookupStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for RawSocketAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSocketAddr")
            .field("len", &self.len)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Why the post-fork handshake failed. Each variant carries at most an errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("socket() failed (errno {0})")]
    Socket(i32),

    #[error("bootstrap lookup of the broker failed (errno {0})")]
    LookUp(i32),

    #[error("sending the check-in token failed (errno {0})")]
    Send(i32),

    #[error("receiving the check-in reply failed (errno {0})")]
    Receive(i32),

    #[error("broker closed the check-in without a reply")]
    NoReply,

    #[error("malformed check-in reply")]
    MalformedReply,

    #[error("check-in reply carried no bootstrap port")]
    MissingPort,

    #[error("installing the bootstrap port failed (errno {0})")]
    Install(i32),
}

impl HandshakeError {
    /// Description that needs no formatting, for use after `fork`.
    pub fn as_static_str(&self) -> &'static str {
        match self {
            HandshakeError::Socket(_) => "socket() failed",
            HandshakeError::LookUp(_) => "bootstrap lookup of the broker failed",
            HandshakeError::Send(_) => "sending the check-in token failed",
            HandshakeError::Receive(_) => "receiving the check-in reply failed",
            HandshakeError::NoReply => "broker closed the check-in without a reply",
            HandshakeError::MalformedReply => "malformed check-in reply",
            HandshakeError::MissingPort => "check-in reply carried no bootstrap port",
            HandshakeError::Install(_) => "installing the bootstrap port failed",
        }
    }
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Client half of the check-in handshake, attached to a `Command`.
pub struct PreExecDelegate {
    address: RawSocketAddr,
    token: u64,
    request: [u8; CheckInRequest::LEN],
    target_fd: RawFd,
    secondary_fd: Option<RawFd>,
}

impl PreExecDelegate {
    pub fn new(address: RawSocketAddr, token: u64, target_fd: RawFd) -> Self {
        Self {
            address,
            token,
            request: CheckInRequest { token }.encode(),
            target_fd,
            secondary_fd: None,
        }
    }

    /// Also install the bootstrap port at `fd` for consumers that look there.
    pub fn with_secondary_fd(mut self, fd: RawFd) -> Self {
        self.secondary_fd = Some(fd);
        self
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn target_fd(&self) -> RawFd {
        self.target_fd
    }

    pub fn secondary_fd(&self) -> Option<RawFd> {
        self.secondary_fd
    }

    pub fn strategy(&self) -> LookupStrategy {
        self.address.strategy()
    }

    /// Look up the broker, check in, and install the returned bootstrap port.
    ///
    /// Async-signal-safe: only syscalls on pre-built and stack buffers.
    pub fn run_async_safe(&self) -> Result<(), HandshakeError> {
        // SAFETY: socket() has no memory-safety preconditions.
        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(HandshakeError::Socket(errno()));
        }
        // SAFETY: `raw` was just returned by socket() and is owned here.
        let sock = unsafe { OwnedFd::from_raw_fd(raw) };

        loop {
            // SAFETY: `addr` is a fully initialised sockaddr_un of `len` bytes.
            let rc = unsafe {
                libc::connect(
                    sock.as_raw_fd(),
                    &self.address.addr as *const libc::sockaddr_un as *const libc::sockaddr,
                    self.address.len,
                )
            };
            if rc == 0 {
                break;
            }
            match errno() {
                libc::EINTR => continue,
                e => return Err(HandshakeError::LookUp(e)),
            }
        }

        write_all(&sock, &self.request).map_err(HandshakeError::Send)?;

        let mut reply = [0u8; CheckInReply::LEN];
        let (n, port) = wire::recv_with_fd(sock.as_fd(), &mut reply)
            .map_err(|e| HandshakeError::Receive(e.raw_os_error().unwrap_or(0)))?;
        if n == 0 {
            return Err(HandshakeError::NoReply);
        }
        read_exact(&sock, &mut reply[n..])?;
        drop(sock);

        CheckInReply::decode(&reply).map_err(|_| HandshakeError::MalformedReply)?;
        let port = port.ok_or(HandshakeError::MissingPort)?;

        install_at(port, self.target_fd)?;
        if let Some(secondary) = self.secondary_fd
            && secondary != self.target_fd
        {
            dup2(self.target_fd, secondary)?;
        }
        Ok(())
    }

    /// Announce the port descriptors in the child's environment and register
    /// the handshake as a pre-exec hook on `cmd`.
    ///
    /// If the handshake fails the child writes a fixed message to stderr and
    /// aborts instead of exec'ing with an unknown bootstrap port.
    pub fn install(self, cmd: &mut Command) {
        cmd.env(BOOTSTRAP_FD_ENV, self.target_fd.to_string());
        match self.secondary_fd {
            Some(fd) => cmd.env(SECONDARY_FD_ENV, fd.to_string()),
            None => cmd.env_remove(SECONDARY_FD_ENV),
        };

        // SAFETY: the hook only performs raw syscalls on memory owned by
        // `self`, which is moved into the closure before fork.
        unsafe {
            cmd.pre_exec(move || {
                if let Err(err) = self.run_async_safe() {
                    abort_with(err);
                }
                Ok(())
            });
        }
    }
}

impl std::fmt::Debug for PreExecDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreExecDelegate")
            .field("address", &self.address)
            .field("target_fd", &self.target_fd)
            .field("secondary_fd", &self.secondary_fd)
            .finish_non_exhaustive()
    }
}

fn write_all(sock: &OwnedFd, mut buf: &[u8]) -> Result<(), i32> {
    while !buf.is_empty() {
        // SAFETY: `buf` is a live slice of initialised bytes.
        let n = unsafe { libc::write(sock.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            match errno() {
                libc::EINTR => continue,
                e => return Err(e),
            }
        }
        if n == 0 {
            return Err(libc::EPIPE);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

fn read_exact(sock: &OwnedFd, mut buf: &mut [u8]) -> Result<(), HandshakeError> {
    while !buf.is_empty() {
        // SAFETY: `buf` is a live, writable slice.
        let n = unsafe { libc::read(sock.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            match errno() {
                libc::EINTR => continue,
                e => return Err(HandshakeError::Receive(e)),
            }
        }
        if n == 0 {
            return Err(HandshakeError::NoReply);
        }
        buf = &mut buf[n as usize..];
    }
    Ok(())
}

fn dup2(from: RawFd, to: RawFd) -> Result<(), HandshakeError> {
    loop {
        // SAFETY: dup2 has no memory-safety preconditions.
        if unsafe { libc::dup2(from, to) } >= 0 {
            return Ok(());
        }
        match errno() {
            libc::EINTR => continue,
            e => return Err(HandshakeError::Install(e)),
        }
    }
}

/// Move `port` to `target`, leaving it open across exec.
fn install_at(port: OwnedFd, target: RawFd) -> Result<(), HandshakeError> {
    if port.as_raw_fd() == target {
        let fd = port.into_raw_fd();
        // SAFETY: clears FD_CLOEXEC on a descriptor we own.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } < 0 {
            return Err(HandshakeError::Install(errno()));
        }
        return Ok(());
    }
    // dup2 leaves FD_CLOEXEC clear on the new descriptor.
    dup2(port.as_raw_fd(), target)
}

fn abort_with(err: HandshakeError) -> ! {
    let parts: [&[u8]; 3] = [
        b"bootstrap-sandbox: pre-exec check-in failed: ",
        err.as_static_str().as_bytes(),
        b"\n",
    ];
    for part in parts {
        // SAFETY: writing static bytes to stderr.
        unsafe {
            libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len());
        }
    }
    // SAFETY: abort() is async-signal-safe and never returns.
    unsafe { libc::abort() }
}
