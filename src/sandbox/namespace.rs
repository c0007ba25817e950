//! The host bootstrap namespace: a directory of named Unix stream sockets.
//!
//! A service registers by binding `<dir>/<name>`; a lookup is a connect to the
//! same path. On Linux the namespace can also live in the abstract socket
//! namespace, where names are `<prefix>/<name>` and no files are created.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Longest service name accepted by `register` and `look_up`.
pub const MAX_SERVICE_NAME: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("invalid service name '{0}'")]
    InvalidName(String),

    #[error("service address for '{0}' does not fit in sockaddr_un")]
    AddressTooLong(String),

    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("namespace I/O error for '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Where a service socket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAddress {
    /// A socket file.
    Path(PathBuf),
    /// A Linux abstract socket name (without the leading NUL).
    #[cfg(target_os = "linux")]
    Abstract(Vec<u8>),
}

impl std::fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceAddress::Path(path) => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            ServiceAddress::Abstract(name) => write!(f, "@{}", String::from_utf8_lossy(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Backing {
    Directory(PathBuf),
    #[cfg(target_os = "linux")]
    Abstract(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    backing: Backing,
}

/// Keeps a registered name alive; unregisters on drop.
#[derive(Debug)]
pub struct Registration {
    name: String,
    path: Option<PathBuf>,
}

impl Registration {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(&path);
            debug!("Unregistered service {} ({})", self.name, path.display());
        }
    }
}

impl Namespace {
    /// Namespace backed by socket files in `dir`.
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            backing: Backing::Directory(dir.into()),
        }
    }

    /// Namespace in the Linux abstract socket namespace under `prefix`.
    #[cfg(target_os = "linux")]
    pub fn abstract_with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            backing: Backing::Abstract(prefix.into()),
        }
    }

    /// Directory holding the socket files, if file-backed.
    pub fn dir(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Directory(dir) => Some(dir),
            #[cfg(target_os = "linux")]
            Backing::Abstract(_) => None,
        }
    }

    pub fn address_for(&self, name: &str) -> Result<ServiceAddress, NamespaceError> {
        validate_name(name)?;
        let address = match &self.backing {
            Backing::Directory(dir) => ServiceAddress::Path(dir.join(name)),
            #[cfg(target_os = "linux")]
            Backing::Abstract(prefix) => {
                ServiceAddress::Abstract(format!("{}/{}", prefix, name).into_bytes())
            }
        };
        if address_len(&address) >= sun_path_capacity() {
            return Err(NamespaceError::AddressTooLong(name.to_string()));
        }
        Ok(address)
    }

    /// Register `name`, returning its listener and the guard that keeps it.
    ///
    /// A leftover socket file nobody is accepting on is replaced.
    pub fn register(&self, name: &str) -> Result<(UnixListener, Registration), NamespaceError> {
        let address = self.address_for(name)?;
        let io_err = |source| NamespaceError::Io {
            name: name.to_string(),
            source,
        };

        match &address {
            ServiceAddress::Path(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(io_err)?;
                }
                if path.exists() {
                    if UnixStream::connect(path).is_ok() {
                        return Err(NamespaceError::AlreadyRegistered(name.to_string()));
                    }
                    debug!("Removing stale service socket {}", path.display());
                    std::fs::remove_file(path).map_err(io_err)?;
                }
                let listener = UnixListener::bind(path).map_err(|e| match e.kind() {
                    io::ErrorKind::AddrInUse => NamespaceError::AlreadyRegistered(name.to_string()),
                    _ => io_err(e),
                })?;
                Ok((
                    listener,
                    Registration {
                        name: name.to_string(),
                        path: Some(path.clone()),
                    },
                ))
            }
            #[cfg(target_os = "linux")]
            ServiceAddress::Abstract(bytes) => {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(bytes)
                    .map_err(io_err)?;
                let listener = UnixListener::bind_addr(&addr).map_err(|e| match e.kind() {
                    io::ErrorKind::AddrInUse => NamespaceError::AlreadyRegistered(name.to_string()),
                    _ => io_err(e),
                })?;
                Ok((
                    listener,
                    Registration {
                        name: name.to_string(),
                        path: None,
                    },
                ))
            }
        }
    }

    /// Connect to the service registered as `name`.
    pub fn look_up(&self, name: &str) -> Result<UnixStream, NamespaceError> {
        let address = self.address_for(name)?;
        let result = match &address {
            ServiceAddress::Path(path) => UnixStream::connect(path),
            #[cfg(target_os = "linux")]
            ServiceAddress::Abstract(bytes) => {
                use std::os::linux::net::SocketAddrExt;
                std::os::unix::net::SocketAddr::from_abstract_name(bytes)
                    .and_then(|addr| UnixStream::connect_addr(&addr))
            }
        };
        result.map_err(|source| match source.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                NamespaceError::UnknownService(name.to_string())
            }
            _ => NamespaceError::Io {
                name: name.to_string(),
                source,
            },
        })
    }
}

/// Bootstrap name under which a broker publishes its check-in port.
///
/// Derived from the host application's bundle identifier and the broker's
/// process id so several brokers on one host never collide.
pub fn broker_service_name(bundle_id: &str, pid: u32) -> String {
    format!("{}.bootstrap-sandbox.{}", bundle_id, pid)
}

fn validate_name(name: &str) -> Result<(), NamespaceError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME
        && name != "."
        && name != ".."
        && !name.contains(['/', '\0']);
    if valid {
        Ok(())
    } else {
        Err(NamespaceError::InvalidName(name.to_string()))
    }
}

/// Bytes available in `sockaddr_un.sun_path`.
pub(crate) fn sun_path_capacity() -> usize {
    // SAFETY: sockaddr_un is plain old data.
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    std::mem::size_of_val(&addr.sun_path)
}

/// Bytes the address occupies in `sun_path`, excluding any trailing NUL.
pub(crate) fn address_len(address: &ServiceAddress) -> usize {
    use std::os::unix::ffi::OsStrExt;
    match address {
        ServiceAddress::Path(path) => path.as_os_str().as_bytes().len(),
        // Leading NUL.
        #[cfg(target_os = "linux")]
        ServiceAddress::Abstract(name) => name.len() + 1,
    }
}
