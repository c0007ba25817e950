//! Interception server: answers lookups made through a sandboxed child's
//! replacement bootstrap port.
//!
//! Every checked-in child gets its own channel. The server knows which pid is
//! on the other end because the broker hands it the channel together with the
//! pid it authenticated at check-in.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::namespace::{Namespace, NamespaceError};
use super::policy::{Rule, SandboxPolicy};
use super::wire::{self, LookUpReply, LookUpRequest, LookUpStatus};

/// Policy lookup offered by the broker to the interception server.
pub trait PolicyResolver: Send + Sync {
    fn policy_for_process(&self, pid: libc::pid_t) -> Option<Arc<SandboxPolicy>>;
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no tokio runtime available to run the interception server")]
    NoRuntime,

    #[error("interception server failed to start: {0}")]
    Start(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait InterceptionServer: Send + Sync {
    /// Prepare to serve clients; called once before any `serve_client`.
    fn start(&mut self, resolver: Arc<dyn PolicyResolver>) -> Result<(), ServerError>;

    /// Serve lookups arriving on `channel` on behalf of `pid`.
    fn serve_client(&self, pid: libc::pid_t, channel: OwnedFd);

    /// Stop serving every client.
    fn shutdown(&self);
}

/// Answer for one lookup.
#[derive(Debug)]
pub struct LookUpResponse {
    pub status: LookUpStatus,
    pub port: Option<OwnedFd>,
}

impl LookUpResponse {
    fn status(status: LookUpStatus) -> Self {
        Self { status, port: None }
    }

    fn port(port: OwnedFd) -> Self {
        Self {
            status: LookUpStatus::Ok,
            port: Some(port),
        }
    }
}

/// Decide how to answer `pid`'s lookup of `name`.
pub fn respond_to_look_up(
    resolver: &dyn PolicyResolver,
    namespace: &Namespace,
    pid: libc::pid_t,
    name: &str,
) -> LookUpResponse {
    let Some(policy) = resolver.policy_for_process(pid) else {
        warn!("Lookup of {} from pid {} with no sandbox policy", name, pid);
        return LookUpResponse::status(LookUpStatus::NotPermitted);
    };

    match policy.rule_for(name) {
        Rule::Allow => forward(namespace, pid, name),
        Rule::Substitute(target) => {
            debug!("Substituting {} with {} for pid {}", name, target, pid);
            forward(namespace, pid, target)
        }
        Rule::DenyError => {
            info!("Denying lookup of {} for pid {}", name, pid);
            LookUpResponse::status(LookUpStatus::NotPermitted)
        }
        Rule::DenyDummyPort => match StdUnixStream::pair() {
            Ok((dummy, peer)) => {
                drop(peer);
                info!("Handing pid {} a dummy port for {}", pid, name);
                LookUpResponse::port(dummy.into())
            }
            Err(e) => {
                warn!("Failed to create dummy port for pid {}: {}", pid, e);
                LookUpResponse::status(LookUpStatus::NotPermitted)
            }
        },
    }
}

fn forward(namespace: &Namespace, pid: libc::pid_t, name: &str) -> LookUpResponse {
    match namespace.look_up(name) {
        Ok(stream) => {
            debug!("Forwarded lookup of {} for pid {}", name, pid);
            LookUpResponse::port(stream.into())
        }
        Err(NamespaceError::UnknownService(_) | NamespaceError::InvalidName(_)) => {
            LookUpResponse::status(LookUpStatus::UnknownService)
        }
        Err(e) => {
            warn!("Forwarded lookup of {} for pid {} failed: {}", name, pid, e);
            LookUpResponse::status(LookUpStatus::UnknownService)
        }
    }
}

/// Interception server that resolves allowed lookups against a real namespace.
pub struct LaunchdInterceptionServer {
    namespace: Namespace,
    resolver: Option<Arc<dyn PolicyResolver>>,
    runtime: Option<tokio::runtime::Handle>,
    clients: Mutex<Vec<JoinHandle<()>>>,
}

impl LaunchdInterceptionServer {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            resolver: None,
            runtime: None,
            clients: Mutex::new(Vec::new()),
        }
    }

    fn clients(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl InterceptionServer for LaunchdInterceptionServer {
    fn start(&mut self, resolver: Arc<dyn PolicyResolver>) -> Result<(), ServerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ServerError::NoRuntime)?;
        self.runtime = Some(runtime);
        self.resolver = Some(resolver);
        Ok(())
    }

    fn serve_client(&self, pid: libc::pid_t, channel: OwnedFd) {
        let (Some(resolver), Some(runtime)) = (self.resolver.clone(), self.runtime.as_ref()) else {
            warn!("Interception server not started; dropping channel for pid {}", pid);
            return;
        };

        let std_stream = StdUnixStream::from(channel);
        if let Err(e) = std_stream.set_nonblocking(true) {
            warn!("Failed to prepare channel for pid {}: {}", pid, e);
            return;
        }
        let stream = {
            let _guard = runtime.enter();
            match UnixStream::from_std(std_stream) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to register channel for pid {}: {}", pid, e);
                    return;
                }
            }
        };

        let namespace = self.namespace.clone();
        let handle = runtime.spawn(serve_channel(pid, stream, resolver, namespace));

        let mut clients = self.clients();
        clients.retain(|h| !h.is_finished());
        clients.push(handle);
    }

    fn shutdown(&self) {
        for handle in self.clients().drain(..) {
            handle.abort();
        }
    }
}

async fn serve_channel(
    pid: libc::pid_t,
    mut stream: UnixStream,
    resolver: Arc<dyn PolicyResolver>,
    namespace: Namespace,
) {
    debug!("Serving bootstrap channel for pid {}", pid);
    loop {
        let mut header = [0u8; LookUpRequest::HEADER_LEN];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                warn!("Bootstrap channel read for pid {} failed: {}", pid, e);
                break;
            }
        }

        let request = match LookUpRequest::body_len(&header) {
            Ok(len) => {
                let mut body = vec![0u8; len];
                if let Err(e) = stream.read_exact(&mut body).await {
                    warn!("Bootstrap channel read for pid {} failed: {}", pid, e);
                    break;
                }
                LookUpRequest::decode(&header, &body)
            }
            Err(e) => Err(e),
        };

        let response = match request {
            // Forwarding connects to the real service, which may block.
            Ok(request) => {
                let resolver = resolver.clone();
                let namespace = namespace.clone();
                let answer = tokio::task::spawn_blocking(move || {
                    respond_to_look_up(resolver.as_ref(), &namespace, pid, &request.name)
                });
                match answer.await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Lookup for pid {} failed: {}", pid, e);
                        LookUpResponse::status(LookUpStatus::UnknownService)
                    }
                }
            }
            Err(e) => {
                warn!("Malformed lookup from pid {}: {}", pid, e);
                let reply = LookUpReply {
                    status: LookUpStatus::Malformed,
                };
                let _ = stream.write_all(&reply.encode()).await;
                break;
            }
        };

        if let Err(e) = send_response(&mut stream, response).await {
            warn!("Lookup reply to pid {} failed: {}", pid, e);
            break;
        }
    }
    debug!("Bootstrap channel for pid {} closed", pid);
}

async fn send_response(stream: &mut UnixStream, response: LookUpResponse) -> io::Result<()> {
    let reply = LookUpReply {
        status: response.status,
    }
    .encode();

    match response.port {
        Some(port) => {
            let sent = stream
                .async_io(Interest::WRITABLE, || {
                    wire::send_with_fd(stream.as_fd(), &reply, port.as_fd())
                })
                .await?;
            if sent < reply.len() {
                stream.write_all(&reply[sent..]).await?;
            }
            Ok(())
        }
        None => stream.write_all(&reply).await,
    }
}
