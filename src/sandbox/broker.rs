//! The sandbox broker.
//!
//! Hands out single-use check-in tokens to launch hooks, authenticates the
//! children that present them, and swaps each child's bootstrap port for a
//! channel to the interception server. One lock guards the policy table, the
//! tokens awaiting check-in and the pids already sandboxed.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::{AsFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::RngExt;
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::namespace::{broker_service_name, Namespace, NamespaceError, Registration, ServiceAddress};
use super::policy::{PolicyId, SandboxPolicy};
use super::pre_exec::{PreExecDelegate, RawSocketAddr, DEFAULT_BOOTSTRAP_FD};
use super::server::{InterceptionServer, LaunchdInterceptionServer, PolicyResolver, ServerError};
use super::wire::{self, CheckInReply, CheckInRequest};

/// Deadline for delivering the check-in reply (and for reading the request).
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Bundle identifier of the host application; prefixes the check-in name.
    pub bundle_id: String,
    pub reply_timeout: Duration,
    /// Descriptor number children receive their bootstrap port at.
    pub bootstrap_fd: RawFd,
    /// Optional second descriptor holding the same port.
    pub secondary_fd: Option<RawFd>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            bundle_id: "org.bootstrap-sandbox".to_string(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            bootstrap_fd: DEFAULT_BOOTSTRAP_FD,
            secondary_fd: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no tokio runtime available to run the broker")]
    NoRuntime,

    #[error("failed to register the check-in port: {0}")]
    Register(#[from] NamespaceError),

    #[error("failed to watch the check-in port: {0}")]
    Watch(#[source] io::Error),

    #[error(transparent)]
    Server(#[from] ServerError),
}

#[derive(Debug, thiserror::Error)]
pub enum CheckInError {
    #[error("unknown or already used check-in token")]
    UnknownToken,

    /// The registry no longer matches the processes it tracks.
    #[error("pid {pid} checked in while already sandboxed")]
    AlreadySandboxed { pid: libc::pid_t },

    #[error("failed to deliver the bootstrap port to pid {pid}: {source}")]
    ReplyFailed {
        pid: libc::pid_t,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default)]
struct ClientState {
    policies: HashMap<PolicyId, Arc<SandboxPolicy>>,
    awaiting: HashMap<u64, PolicyId>,
    sandboxed: HashMap<libc::pid_t, Sandboxed>,
}

#[derive(Debug, Clone, Copy)]
struct Sandboxed {
    policy: PolicyId,
    // Token the pid checked in with.
    token: u64,
}

/// Policy table plus the per-client bookkeeping of the check-in protocol.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    state: Mutex<ClientState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state
            .lock()
            .expect("sandbox client state lock poisoned")
    }

    /// Panics if `id` is already registered.
    pub fn register_sandbox_policy(&self, id: PolicyId, policy: SandboxPolicy) {
        let mut state = self.state();
        assert!(
            !state.policies.contains_key(&id),
            "sandbox policy {} registered twice",
            id
        );
        state.policies.insert(id, Arc::new(policy));
        debug!("Registered sandbox policy {}", id);
    }

    /// Issue a fresh token for a child that will run under policy `id`.
    ///
    /// Panics if `id` is not registered.
    pub fn issue_token(&self, id: PolicyId) -> u64 {
        let mut rng = rand::rng();
        self.issue_token_with(id, || rng.random::<u64>())
    }

    /// Like `issue_token`, drawing candidates from `next` until one is not
    /// currently awaiting check-in.
    pub fn issue_token_with(&self, id: PolicyId, mut next: impl FnMut() -> u64) -> u64 {
        let mut state = self.state();
        assert!(
            state.policies.contains_key(&id),
            "new client for unregistered sandbox policy {}",
            id
        );
        let token = loop {
            let candidate = next();
            if !state.awaiting.contains_key(&candidate) {
                break candidate;
            }
        };
        state.awaiting.insert(token, id);
        token
    }

    /// Forget a token that will never be presented. No-op if unknown.
    pub fn revoke_token(&self, token: u64) {
        if self.state().awaiting.remove(&token).is_some() {
            debug!("Revoked check-in token");
        }
    }

    /// Forget a sandboxed process, typically after it exits.
    pub fn invalidate_client(&self, pid: libc::pid_t) {
        if self.state().sandboxed.remove(&pid).is_some() {
            debug!("Invalidated sandboxed pid {}", pid);
        }
    }

    /// Forget the process that checked in with `token`, if any.
    ///
    /// For launches whose exec failed after the hook had already checked in:
    /// the caller never learns that child's pid.
    pub fn invalidate_token_holder(&self, token: u64) {
        let mut state = self.state();
        let pid = state
            .sandboxed
            .iter()
            .find_map(|(pid, entry)| (entry.token == token).then_some(*pid));
        if let Some(pid) = pid {
            state.sandboxed.remove(&pid);
            debug!("Invalidated sandboxed pid {} of a failed launch", pid);
        }
    }

    pub fn policy_for_process(&self, pid: libc::pid_t) -> Option<Arc<SandboxPolicy>> {
        let state = self.state();
        let entry = state.sandboxed.get(&pid)?;
        state.policies.get(&entry.policy).cloned()
    }

    pub fn policy_id_for_process(&self, pid: libc::pid_t) -> Option<PolicyId> {
        self.state().sandboxed.get(&pid).map(|entry| entry.policy)
    }

    pub fn is_awaiting(&self, token: u64) -> bool {
        self.state().awaiting.contains_key(&token)
    }

    pub fn awaiting_count(&self) -> usize {
        self.state().awaiting.len()
    }

    pub fn sandboxed_count(&self) -> usize {
        self.state().sandboxed.len()
    }

    /// Accept `pid`'s check-in with `token` and deliver its reply.
    ///
    /// The token is consumed and the pid recorded as sandboxed before `reply`
    /// runs. If `reply` fails the pid is removed again. The lock is not held
    /// while `reply` is pending.
    ///
    /// A pid that is already sandboxed consumes the token, leaves the existing
    /// entry untouched and yields `AlreadySandboxed`. Callers must treat that
    /// as fatal.
    pub async fn check_in<F, Fut, T>(
        &self,
        token: u64,
        pid: libc::pid_t,
        reply: F,
    ) -> Result<T, CheckInError>
    where
        F: FnOnce(PolicyId) -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let id = {
            let mut state = self.state();
            let Some(id) = state.awaiting.remove(&token) else {
                return Err(CheckInError::UnknownToken);
            };
            if state.sandboxed.contains_key(&pid) {
                return Err(CheckInError::AlreadySandboxed { pid });
            }
            state.sandboxed.insert(pid, Sandboxed { policy: id, token });
            id
        };

        match reply(id).await {
            Ok(value) => Ok(value),
            Err(source) => {
                self.state().sandboxed.remove(&pid);
                Err(CheckInError::ReplyFailed { pid, source })
            }
        }
    }
}

impl PolicyResolver for ClientRegistry {
    fn policy_for_process(&self, pid: libc::pid_t) -> Option<Arc<SandboxPolicy>> {
        ClientRegistry::policy_for_process(self, pid)
    }
}

/// A running broker: the check-in port, its watcher task and the
/// interception server.
pub struct BootstrapSandbox {
    registry: Arc<ClientRegistry>,
    server: Arc<dyn InterceptionServer>,
    service_name: String,
    check_in_address: ServiceAddress,
    raw_address: RawSocketAddr,
    bootstrap_fd: RawFd,
    secondary_fd: Option<RawFd>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<Registration>>,
}

impl BootstrapSandbox {
    /// Start a broker whose interception server forwards allowed lookups to
    /// `namespace`.
    pub fn create(options: BrokerOptions, namespace: Namespace) -> Result<Arc<Self>, BrokerError> {
        let server = Box::new(LaunchdInterceptionServer::new(namespace.clone()));
        Self::create_with_server(options, namespace, server)
    }

    /// Start a broker with a caller-supplied interception server.
    ///
    /// Must be called from within a tokio runtime. Nothing is left registered
    /// or running if any step fails.
    pub fn create_with_server(
        options: BrokerOptions,
        namespace: Namespace,
        mut server: Box<dyn InterceptionServer>,
    ) -> Result<Arc<Self>, BrokerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BrokerError::NoRuntime)?;
        let _guard = runtime.enter();

        let service_name = broker_service_name(&options.bundle_id, std::process::id());
        let check_in_address = namespace.address_for(&service_name)?;
        let raw_address = RawSocketAddr::new(&check_in_address)?;

        let (listener, registration) = namespace.register(&service_name)?;
        listener.set_nonblocking(true).map_err(BrokerError::Watch)?;
        let listener = UnixListener::from_std(listener).map_err(BrokerError::Watch)?;

        let registry = Arc::new(ClientRegistry::new());
        server.start(registry.clone())?;
        let server: Arc<dyn InterceptionServer> = Arc::from(server);

        let watcher = runtime.spawn(watch_check_ins(
            listener,
            registry.clone(),
            server.clone(),
            options.reply_timeout,
        ));

        info!("Bootstrap sandbox broker listening at {}", check_in_address);

        Ok(Arc::new(Self {
            registry,
            server,
            service_name,
            check_in_address,
            raw_address,
            bootstrap_fd: options.bootstrap_fd,
            secondary_fd: options.secondary_fd,
            watcher: Mutex::new(Some(watcher)),
            registration: Mutex::new(Some(registration)),
        }))
    }

    pub fn register_sandbox_policy(&self, id: PolicyId, policy: SandboxPolicy) {
        self.registry.register_sandbox_policy(id, policy);
    }

    /// Prepare the launch hook for one child under policy `id`.
    ///
    /// Panics if `id` is not registered.
    pub fn new_client(&self, id: PolicyId) -> PreExecDelegate {
        let token = self.registry.issue_token(id);
        let delegate = PreExecDelegate::new(self.raw_address, token, self.bootstrap_fd);
        match self.secondary_fd {
            Some(fd) => delegate.with_secondary_fd(fd),
            None => delegate,
        }
    }

    pub fn revoke_token(&self, token: u64) {
        self.registry.revoke_token(token);
    }

    pub fn invalidate_client(&self, pid: libc::pid_t) {
        self.registry.invalidate_client(pid);
    }

    pub fn policy_for_process(&self, pid: libc::pid_t) -> Option<Arc<SandboxPolicy>> {
        self.registry.policy_for_process(pid)
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Name the check-in port is registered under.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn check_in_address(&self) -> &ServiceAddress {
        &self.check_in_address
    }

    /// Stop the watcher and the interception server and unregister the
    /// check-in port. Idempotent.
    pub fn shutdown(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.abort();
            self.server.shutdown();
            debug!("Bootstrap sandbox broker {} stopped", self.service_name);
        }
        self.registration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}

impl Drop for BootstrapSandbox {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BootstrapSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapSandbox")
            .field("service_name", &self.service_name)
            .field("check_in_address", &self.check_in_address)
            .field("bootstrap_fd", &self.bootstrap_fd)
            .finish_non_exhaustive()
    }
}

async fn watch_check_ins(
    listener: UnixListener,
    registry: Arc<ClientRegistry>,
    server: Arc<dyn InterceptionServer>,
    reply_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            // One check-in at a time.
            Ok((stream, _)) => handle_check_in(stream, &registry, server.as_ref(), reply_timeout).await,
            Err(e) => {
                warn!("Check-in accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_check_in(
    mut stream: UnixStream,
    registry: &ClientRegistry,
    server: &dyn InterceptionServer,
    reply_timeout: Duration,
) {
    let pid = match stream.peer_cred().map(|cred| cred.pid()) {
        Ok(Some(pid)) => pid,
        Ok(None) => {
            warn!("Dropping check-in from a peer without a pid");
            return;
        }
        Err(e) => {
            warn!("Dropping check-in: peer credentials unavailable: {}", e);
            return;
        }
    };

    let mut request = [0u8; CheckInRequest::LEN];
    match tokio::time::timeout(reply_timeout, stream.read_exact(&mut request)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!("Dropping check-in from pid {}: {}", pid, e);
            return;
        }
        Err(_) => {
            warn!("Dropping check-in from pid {}: request timed out", pid);
            return;
        }
    }
    let token = match CheckInRequest::decode(&request) {
        Ok(request) => request.token,
        Err(e) => {
            warn!("Dropping malformed check-in from pid {}: {}", pid, e);
            return;
        }
    };

    let channel = &stream;
    let result = registry
        .check_in(token, pid, |id| async move {
            let (server_end, client_end) = StdUnixStream::pair()?;
            let reply = CheckInReply.encode();
            let send = channel.async_io(Interest::WRITABLE, || {
                wire::send_with_fd(channel.as_fd(), &reply, client_end.as_fd())
            });
            let sent = tokio::time::timeout(reply_timeout, send)
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
            if sent != reply.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short check-in reply",
                ));
            }
            Ok((id, server_end))
        })
        .await;

    match result {
        Ok((id, server_end)) => {
            info!("pid {} checked in under sandbox policy {}", pid, id);
            server.serve_client(pid, server_end.into());
        }
        Err(CheckInError::UnknownToken) => {
            warn!("Dropping check-in from pid {} with an unknown token", pid);
        }
        Err(e @ CheckInError::AlreadySandboxed { .. }) => {
            error!("{}; aborting the broker", e);
            std::process::abort();
        }
        Err(e) => warn!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::Rule;
    use crate::sandbox::server::MockInterceptionServer;
    use std::collections::HashSet;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    fn registry_with(ids: &[i32]) -> ClientRegistry {
        let registry = ClientRegistry::new();
        for id in ids {
            registry.register_sandbox_policy(PolicyId(*id), SandboxPolicy::deny_all());
        }
        registry
    }

    fn ok_reply(_: PolicyId) -> std::future::Ready<io::Result<()>> {
        std::future::ready(Ok(()))
    }

    // Short paths keep socket addresses inside sun_path.
    fn short_tempdir() -> tempfile::TempDir {
        tempfile::Builder::new()
            .prefix("bsb")
            .tempdir_in("/tmp")
            .unwrap()
    }

    fn test_options() -> BrokerOptions {
        BrokerOptions {
            bundle_id: "t".to_string(),
            ..BrokerOptions::default()
        }
    }

    #[test]
    fn tokens_are_unique_among_awaiting() {
        let registry = registry_with(&[1]);
        let tokens: HashSet<u64> = (0..10_000)
            .map(|_| registry.issue_token(PolicyId(1)))
            .collect();
        assert_eq!(tokens.len(), 10_000);
        assert_eq!(registry.awaiting_count(), 10_000);
    }

    #[test]
    fn colliding_token_is_resampled() {
        let registry = registry_with(&[1]);
        let first = registry.issue_token_with(PolicyId(1), || 7);

        let mut candidates = vec![7, 7, 9].into_iter();
        let second = registry.issue_token_with(PolicyId(1), || candidates.next().unwrap());

        assert_eq!(first, 7);
        assert_eq!(second, 9);
        assert!(registry.is_awaiting(7));
        assert!(registry.is_awaiting(9));
    }

    #[test]
    #[should_panic(expected = "unregistered sandbox policy")]
    fn new_client_requires_registered_policy() {
        registry_with(&[1]).issue_token(PolicyId(2));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_policy_is_fatal() {
        registry_with(&[1, 1]);
    }

    #[tokio::test]
    async fn check_in_round_trip() {
        let registry = registry_with(&[1]);
        let token = registry.issue_token(PolicyId(1));

        let id = registry
            .check_in(token, 100, |id| async move { Ok(id) })
            .await
            .unwrap();

        assert_eq!(id, PolicyId(1));
        assert!(!registry.is_awaiting(token));
        assert!(registry.policy_for_process(100).is_some());
        assert_eq!(registry.policy_id_for_process(100), Some(PolicyId(1)));

        registry.invalidate_client(100);
        assert!(registry.policy_for_process(100).is_none());
    }

    #[tokio::test]
    async fn token_is_single_use() {
        let registry = registry_with(&[1]);
        let token = registry.issue_token(PolicyId(1));

        registry.check_in(token, 100, ok_reply).await.unwrap();
        let replay = registry.check_in(token, 101, ok_reply).await;

        assert!(matches!(replay, Err(CheckInError::UnknownToken)));
        assert!(registry.policy_for_process(101).is_none());
        assert_eq!(registry.sandboxed_count(), 1);
    }

    #[tokio::test]
    async fn revoked_token_cannot_check_in() {
        let registry = registry_with(&[1]);
        let token = registry.issue_token(PolicyId(1));

        registry.revoke_token(token);
        registry.revoke_token(token);
        assert_eq!(registry.awaiting_count(), 0);

        let result = registry.check_in(token, 100, ok_reply).await;
        assert!(matches!(result, Err(CheckInError::UnknownToken)));
        assert!(registry.policy_for_process(100).is_none());
    }

    #[tokio::test]
    async fn revoke_never_touches_sandboxed() {
        let registry = registry_with(&[1]);
        let token = registry.issue_token(PolicyId(1));
        registry.check_in(token, 100, ok_reply).await.unwrap();

        registry.revoke_token(token);
        assert!(registry.policy_for_process(100).is_some());

        registry.invalidate_client(100);
        registry.invalidate_client(100);
        assert_eq!(registry.sandboxed_count(), 0);
    }

    #[tokio::test]
    async fn policies_are_tracked_per_pid() {
        let registry = ClientRegistry::new();
        registry.register_sandbox_policy(
            PolicyId(1),
            SandboxPolicy::deny_all().with_rule("svc", Rule::Allow),
        );
        registry.register_sandbox_policy(PolicyId(2), SandboxPolicy::deny_all());

        let a = registry.issue_token(PolicyId(1));
        let b = registry.issue_token(PolicyId(2));
        registry.check_in(b, 200, ok_reply).await.unwrap();
        registry.check_in(a, 100, ok_reply).await.unwrap();

        assert_eq!(registry.policy_for_process(100).unwrap().rule_for("svc"), &Rule::Allow);
        assert_eq!(
            registry.policy_for_process(200).unwrap().rule_for("svc"),
            &Rule::DenyError
        );
    }

    #[tokio::test]
    async fn reply_failure_rolls_back() {
        let registry = registry_with(&[1]);
        let token = registry.issue_token(PolicyId(1));

        let result: Result<(), _> = registry
            .check_in(token, 100, |_| async {
                Err(io::Error::from(io::ErrorKind::TimedOut))
            })
            .await;

        assert!(matches!(result, Err(CheckInError::ReplyFailed { pid: 100, .. })));
        assert!(registry.policy_for_process(100).is_none());
        assert!(!registry.is_awaiting(token));
    }

    #[tokio::test]
    async fn sandboxed_while_reply_pending() {
        let registry = registry_with(&[1]);
        let token = registry.issue_token(PolicyId(1));

        let observer = &registry;
        let seen = registry
            .check_in(token, 100, |_| async move {
                Ok(observer.policy_for_process(100).is_some() && !observer.is_awaiting(token))
            })
            .await
            .unwrap();
        assert!(seen);
    }

    #[tokio::test]
    async fn token_holder_can_be_invalidated() {
        let registry = registry_with(&[1]);
        let a = registry.issue_token(PolicyId(1));
        let b = registry.issue_token(PolicyId(1));
        registry.check_in(a, 100, ok_reply).await.unwrap();
        registry.check_in(b, 200, ok_reply).await.unwrap();

        registry.invalidate_token_holder(a);
        registry.invalidate_token_holder(a);
        assert!(registry.policy_for_process(100).is_none());
        assert!(registry.policy_for_process(200).is_some());
    }

    #[tokio::test]
    async fn duplicate_pid_is_reported_without_touching_state() {
        let registry = registry_with(&[1]);
        let a = registry.issue_token(PolicyId(1));
        let b = registry.issue_token(PolicyId(1));
        registry.check_in(a, 100, ok_reply).await.unwrap();

        let mut replied = false;
        let result = registry
            .check_in(b, 100, |_| {
                replied = true;
                std::future::ready(Ok(()))
            })
            .await;

        assert!(matches!(result, Err(CheckInError::AlreadySandboxed { pid: 100 })));
        assert!(!replied);
        assert!(!registry.is_awaiting(b));
        assert_eq!(registry.sandboxed_count(), 1);
        assert_eq!(registry.policy_id_for_process(100), Some(PolicyId(1)));
    }

    #[test]
    fn revoking_unknown_token_is_a_no_op() {
        let registry = registry_with(&[1]);
        let pending = registry.issue_token(PolicyId(1));

        registry.revoke_token(0xdead);
        assert_eq!(registry.awaiting_count(), 1);
        assert_eq!(registry.sandboxed_count(), 0);
        assert!(registry.is_awaiting(pending));
    }

    fn connect_check_in(broker: &BootstrapSandbox) -> StdUnixStream {
        match broker.check_in_address() {
            ServiceAddress::Path(path) => StdUnixStream::connect(path).unwrap(),
            #[cfg(target_os = "linux")]
            other => panic!("unexpected check-in address {}", other),
        }
    }

    /// Check in from this process and return how many reply bytes came back.
    async fn raw_check_in(broker: &BootstrapSandbox, token: u64) -> usize {
        let stream = connect_check_in(broker);
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut stream = stream;
            stream.write_all(&CheckInRequest { token }.encode()).unwrap();
            let mut reply = [0u8; CheckInReply::LEN];
            match wire::recv_with_fd(stream.as_fd(), &mut reply) {
                Ok((n, _port)) => n,
                Err(_) => 0,
            }
        })
        .await
        .unwrap()
    }

    async fn assert_child_checks_in(broker: &BootstrapSandbox) {
        let delegate = broker.new_client(PolicyId(1));
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        delegate.install(&mut cmd);

        let mut child = tokio::task::spawn_blocking(move || cmd.spawn())
            .await
            .unwrap()
            .unwrap();
        let pid = child.id() as libc::pid_t;
        assert!(broker.policy_for_process(pid).is_some());

        child.kill().unwrap();
        child.wait().unwrap();
        broker.invalidate_client(pid);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_survives_misbehaving_clients() {
        use std::io::Write;

        let tmp = short_tempdir();
        let broker =
            BootstrapSandbox::create(test_options(), Namespace::directory(tmp.path())).unwrap();
        broker.register_sandbox_policy(PolicyId(1), SandboxPolicy::deny_all());

        // Closes before writing anything.
        drop(connect_check_in(&broker));

        // Short garbage.
        let mut short = connect_check_in(&broker);
        short.write_all(&[0xde, 0xad, 0xbe]).unwrap();
        drop(short);

        // Full-length frame with the wrong message id.
        let mut wrong_id = CheckInRequest { token: 1 }.encode();
        wrong_id[..4].copy_from_slice(&wire::LOOK_UP_MSG_ID.to_le_bytes());
        let mut wrong = connect_check_in(&broker);
        wrong.write_all(&wrong_id).unwrap();
        drop(wrong);

        // Well-formed but never issued.
        assert_eq!(raw_check_in(&broker, 0xfeed).await, 0);

        // Opens and stalls until the request deadline passes.
        let stalled = connect_check_in(&broker);

        assert_child_checks_in(&broker).await;
        drop(stalled);
        assert_eq!(broker.registry().sandboxed_count(), 0);
        assert_eq!(broker.registry().awaiting_count(), 0);
    }

    const DUPLICATE_CHECK_IN_CHILD: &str = "BOOTSTRAP_SANDBOX_TEST_DUPLICATE_CHECK_IN";

    // Runs in a re-executed test binary; the broker must abort it.
    fn check_in_twice_from_one_process() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let tmp = short_tempdir();
            let broker =
                BootstrapSandbox::create(test_options(), Namespace::directory(tmp.path()))
                    .unwrap();
            broker.register_sandbox_policy(PolicyId(1), SandboxPolicy::deny_all());
            let first = broker.new_client(PolicyId(1)).token();
            let second = broker.new_client(PolicyId(1)).token();

            assert_eq!(raw_check_in(&broker, first).await, CheckInReply::LEN);
            println!("first check-in accepted");

            raw_check_in(&broker, second).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            println!("broker still running");
        });
    }

    #[test]
    fn duplicate_pid_aborts_the_broker() {
        if std::env::var_os(DUPLICATE_CHECK_IN_CHILD).is_some() {
            check_in_twice_from_one_process();
            return;
        }

        let output = Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "sandbox::broker::tests::duplicate_pid_aborts_the_broker",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(DUPLICATE_CHECK_IN_CHILD, "1")
            .output()
            .unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert_eq!(
            output.status.signal(),
            Some(libc::SIGABRT),
            "stdout: {}\nstderr: {}",
            stdout,
            stderr
        );
        assert!(stdout.contains("first check-in accepted"), "{}", stdout);
        assert!(!stdout.contains("broker still running"), "{}", stdout);
    }

    #[test]
    fn create_requires_runtime() {
        let tmp = short_tempdir();
        let result = BootstrapSandbox::create(test_options(), Namespace::directory(tmp.path()));
        assert!(matches!(result, Err(BrokerError::NoRuntime)));
    }

    #[tokio::test]
    async fn create_tears_down_when_server_fails() {
        let tmp = short_tempdir();
        let mut server = MockInterceptionServer::new();
        server
            .expect_start()
            .returning(|_| Err(ServerError::Start("refused".into())));

        let result = BootstrapSandbox::create_with_server(
            test_options(),
            Namespace::directory(tmp.path()),
            Box::new(server),
        );

        assert!(matches!(result, Err(BrokerError::Server(_))));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn create_fails_when_name_taken() {
        let tmp = short_tempdir();
        let ns = Namespace::directory(tmp.path());
        let _first = BootstrapSandbox::create(test_options(), ns.clone()).unwrap();
        let second = BootstrapSandbox::create(test_options(), ns);
        assert!(matches!(
            second,
            Err(BrokerError::Register(NamespaceError::AlreadyRegistered(_)))
        ));
    }

    #[tokio::test]
    async fn shutdown_unregisters_check_in_port() {
        let tmp = short_tempdir();
        let broker =
            BootstrapSandbox::create(test_options(), Namespace::directory(tmp.path())).unwrap();
        let path = tmp.path().join(broker.service_name());
        assert!(path.exists());

        broker.shutdown();
        broker.shutdown();
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn child_checks_in_and_is_sandboxed() {
        let tmp = short_tempdir();
        let broker =
            BootstrapSandbox::create(test_options(), Namespace::directory(tmp.path())).unwrap();
        broker.register_sandbox_policy(PolicyId(1), SandboxPolicy::deny_all());

        let delegate = broker.new_client(PolicyId(1));
        let token = delegate.token();
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        delegate.install(&mut cmd);

        let mut child = tokio::task::spawn_blocking(move || cmd.spawn())
            .await
            .unwrap()
            .unwrap();
        let pid = child.id() as libc::pid_t;

        assert!(!broker.registry().is_awaiting(token));
        assert!(broker.policy_for_process(pid).is_some());

        child.kill().unwrap();
        child.wait().unwrap();
        broker.invalidate_client(pid);
        assert!(broker.policy_for_process(pid).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn revoked_child_aborts_before_exec() {
        let tmp = short_tempdir();
        let broker =
            BootstrapSandbox::create(test_options(), Namespace::directory(tmp.path())).unwrap();
        broker.register_sandbox_policy(PolicyId(1), SandboxPolicy::deny_all());

        let delegate = broker.new_client(PolicyId(1));
        broker.revoke_token(delegate.token());
        let mut cmd = Command::new("true");
        cmd.stderr(std::process::Stdio::null());
        delegate.install(&mut cmd);

        let status = tokio::task::spawn_blocking(move || cmd.status())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status.signal(), Some(libc::SIGABRT));
        assert_eq!(broker.registry().sandboxed_count(), 0);
    }
}
