//! The authenticated SSH transport underneath a control session.
//!
//! One [`TransportChannel`] wraps one russh client connection. Exec and
//! SFTP operations are serialized by a single internal mutex: the remote
//! server cannot service both concurrently without corrupting either
//! stream. Every operation carries a deadline; expiry marks the transport
//! dead and there is no automatic retry below a full reconnect.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use x2go_core::error::{Error, Result};
use x2go_core::wire;

use crate::config::SshProxy;
use crate::hooks::SessionHooks;

/// A bidirectional byte stream carrying one forwarded connection.
pub trait ForwardStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ForwardStream for T {}

/// Incoming connections of one reverse forward.
pub type ForwardReceiver = mpsc::UnboundedReceiver<Box<dyn ForwardStream>>;

/// Exec, SFTP and reverse-forward access to one authenticated transport.
///
/// Abstracted as a trait so the protocol layers can be driven against a
/// scripted fake server in tests.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Execute a server command under the transport mutex.
    ///
    /// The command is wrapped in sanitizing markers and credential macros
    /// are substituted before execution. Returns sanitized stdout and raw
    /// stderr.
    async fn exec(&self, cmd: &str, timeout: Duration) -> Result<(String, String)>;

    /// Create a text file on the server via SFTP.
    async fn sftp_write(&self, remote_path: &str, content: &str, timeout: Duration) -> Result<()>;

    /// Upload a local file to the server via SFTP.
    async fn sftp_put(&self, local_path: &Path, remote_path: &str, timeout: Duration)
        -> Result<()>;

    /// Remove a server-side file via SFTP.
    async fn sftp_remove(&self, remote_path: &str, timeout: Duration) -> Result<()>;

    /// Probe that an SFTP channel can be opened at all.
    async fn sftp_probe(&self) -> Result<()>;

    /// Request a server-side reverse forward for `server_port`.
    ///
    /// Incoming channels on that port are handed out through the returned
    /// receiver until the forward is cancelled.
    async fn request_reverse_forward(&self, server_port: u16) -> Result<ForwardReceiver>;

    /// Cancel a previously requested reverse forward.
    async fn cancel_reverse_forward(&self, server_port: u16) -> Result<()>;

    /// The SSH-authenticated remote user name.
    fn username(&self) -> String;

    /// Peer host name or address of the transport.
    fn peer_host(&self) -> String;

    /// True once the transport has been marked dead.
    fn is_dead(&self) -> bool;

    /// Mark the transport dead (no further operations will be attempted).
    fn mark_dead(&self);
}

/// Routes incoming forwarded channels to the tunnel that requested them.
#[derive(Default)]
struct ForwardRouter {
    routes: std::sync::Mutex<Vec<(u16, mpsc::UnboundedSender<Box<dyn ForwardStream>>)>>,
}

impl ForwardRouter {
    fn register(&self, port: u16) -> ForwardReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|(p, _)| *p != port);
        routes.push((port, tx));
        rx
    }

    fn unregister(&self, port: u16) {
        self.routes.lock().unwrap().retain(|(p, _)| *p != port);
    }

    fn dispatch(&self, port: u16, stream: Box<dyn ForwardStream>) -> bool {
        let routes = self.routes.lock().unwrap();
        if let Some((_, tx)) = routes.iter().find(|(p, _)| *p == port) {
            return tx.send(stream).is_ok();
        }
        false
    }
}

/// russh event handler: host-key verification and forwarded channels.
struct ClientHandler {
    hooks: Arc<dyn SessionHooks>,
    host: String,
    port: u16,
    accept_unknown_keys: bool,
    router: Arc<ForwardRouter>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if self.accept_unknown_keys {
            debug!(host = %self.host, "auto-accepting server host key");
            return Ok(true);
        }
        let fingerprint = server_public_key.fingerprint();
        Ok(self.hooks.accept_host_key(&self.host, self.port, &fingerprint))
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connected = %format!("{connected_address}:{connected_port}"),
            originator = %format!("{originator_address}:{originator_port}"),
            "incoming forwarded channel"
        );
        if !self
            .router
            .dispatch(connected_port as u16, Box::new(channel.into_stream()))
        {
            warn!(port = connected_port, "no tunnel registered for forwarded channel, dropping");
        }
        Ok(())
    }
}

/// Key material resolved for one authentication rung.
pub(crate) enum AuthRung {
    /// Try this concrete private key.
    Key(Arc<russh_keys::key::KeyPair>),
    /// Try plain password authentication.
    Password(String),
}

/// One authenticated russh connection plus the transport-wide mutex.
pub struct TransportChannel {
    handle: Mutex<client::Handle<ClientHandler>>,
    /// Serializes exec and SFTP; the server cannot multiplex them.
    op_lock: Mutex<()>,
    dead: AtomicBool,
    username: String,
    peer_host: String,
    /// Base64-encoded copy of the session password for macro substitution.
    session_password: Option<String>,
    low_latency: bool,
    router: Arc<ForwardRouter>,
    proxy: Option<Arc<dyn SshProxy>>,
    /// Kept open while agent forwarding is active.
    _agent_channel: Option<Channel<Msg>>,
}

impl TransportChannel {
    /// Connect and authenticate one SSH transport.
    ///
    /// `rungs` is the ordered ladder of authentication attempts; the first
    /// success wins. The caller has already resolved keys, discovery and
    /// the throwaway-password fallback into concrete rungs.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        username: &str,
        rungs: Vec<AuthRung>,
        accept_unknown_keys: bool,
        forward_agent: bool,
        low_latency: bool,
        hooks: Arc<dyn SessionHooks>,
        proxy: Option<Arc<dyn SshProxy>>,
    ) -> Result<Self> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(x2go_core::constants::KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            // the server-side scripts cannot cope with compressed streams
            preferred: russh::Preferred {
                compression: &["none"],
                ..Default::default()
            },
            ..Default::default()
        });

        let router = Arc::new(ForwardRouter::default());
        let handler = ClientHandler {
            hooks,
            host: host.to_owned(),
            port,
            accept_unknown_keys,
            router: Arc::clone(&router),
        };

        let addr = (host, port);
        let mut handle =
            tokio::time::timeout(x2go_core::constants::CONNECT_TIMEOUT, async move {
                client::connect(config, addr, handler).await
            })
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(map_ssh_error)?;

        let mut session_password = None;
        let mut authenticated = false;
        for rung in rungs {
            let ok = match &rung {
                AuthRung::Key(key) => {
                    debug!(user = username, "trying SSH public key authentication");
                    handle
                        .authenticate_publickey(username, Arc::clone(key))
                        .await
                        .map_err(map_ssh_error)?
                }
                AuthRung::Password(password) => {
                    debug!(user = username, "trying SSH password authentication");
                    let ok = handle
                        .authenticate_password(username, password.as_str())
                        .await
                        .map_err(map_ssh_error)?;
                    if ok {
                        session_password = Some(BASE64.encode(password));
                    }
                    ok
                }
            };
            if ok {
                authenticated = true;
                break;
            }
        }
        if !authenticated {
            return Err(Error::AuthenticationFailed);
        }

        let mut agent_channel = None;
        if forward_agent {
            match handle.channel_open_session().await {
                Ok(mut channel) => match channel.agent_forward(true).await {
                    Ok(()) => {
                        debug!(user = username, "SSH agent forwarding requested");
                        agent_channel = Some(channel);
                    }
                    Err(err) => warn!(%err, "SSH agent forwarding request failed"),
                },
                Err(err) => warn!(%err, "could not open channel for agent forwarding"),
            }
        }

        Ok(TransportChannel {
            handle: Mutex::new(handle),
            op_lock: Mutex::new(()),
            dead: AtomicBool::new(false),
            username: username.to_owned(),
            peer_host: host.to_owned(),
            session_password,
            low_latency,
            router,
            proxy,
            _agent_channel: agent_channel,
        })
    }

    /// Disconnect the transport, stopping an associated proxy task.
    pub async fn disconnect(&self) {
        self.mark_dead();
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        if let Some(proxy) = &self.proxy {
            proxy.stop().await;
        }
    }

    fn effective_timeout(&self, timeout: Duration) -> Duration {
        if self.low_latency {
            timeout * 2
        } else {
            timeout
        }
    }

    /// Mark the transport dead and stop the proxy background task.
    fn fail_transport(&self, err: Error) -> Error {
        self.mark_dead();
        if let Some(proxy) = &self.proxy {
            let proxy = Arc::clone(proxy);
            tokio::spawn(async move { proxy.stop().await });
        }
        err
    }

    async fn exec_raw(&self, cmd: String) -> Result<(String, String)> {
        let handle = self.handle.lock().await;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(map_ssh_error)?;
        channel.exec(true, cmd.as_str()).await.map_err(map_ssh_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    async fn open_sftp(&self) -> Result<russh_sftp::client::SftpSession> {
        let handle = self.handle.lock().await;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|_| Error::SftpUnavailable)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|_| Error::SftpUnavailable)?;
        russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|_| Error::SftpUnavailable)
    }
}

#[async_trait]
impl CommandTransport for TransportChannel {
    async fn exec(&self, cmd: &str, timeout: Duration) -> Result<(String, String)> {
        if self.is_dead() {
            debug!(cmd = %wire::decode_spaces(cmd), "not executing command, transport is dead");
            return Err(Error::SessionDead);
        }

        let marker_id = Uuid::new_v4().to_string();
        let password = self
            .session_password
            .as_ref()
            .and_then(|b64| BASE64.decode(b64).ok())
            .and_then(|raw| String::from_utf8(raw).ok());
        let cmd = wire::substitute_credentials(cmd, Some(&self.username), password.as_deref());
        let wrapped = wire::wrap_command(&cmd, &marker_id);

        let _guard = self.op_lock.lock().await;
        debug!(cmd = %wire::decode_spaces(&cmd), "executing command on server");

        let (raw_stdout, stderr) =
            match tokio::time::timeout(self.effective_timeout(timeout), self.exec_raw(wrapped))
                .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => return Err(self.fail_transport(err)),
                Err(_) => return Err(self.fail_transport(Error::Timeout)),
            };

        Ok((wire::sanitize_output(&raw_stdout, &marker_id), stderr))
    }

    async fn sftp_write(&self, remote_path: &str, content: &str, timeout: Duration) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        debug!(remote_path, "sftp: writing remote file");
        let fut = async {
            let sftp = self.open_sftp().await?;
            let mut file = sftp.create(remote_path).await.map_err(|e| Error::TransportLost {
                message: format!("sftp create failed: {e}"),
            })?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| Error::TransportLost {
                    message: format!("sftp write failed: {e}"),
                })?;
            file.shutdown().await.map_err(|e| Error::TransportLost {
                message: format!("sftp close failed: {e}"),
            })?;
            Ok(())
        };
        match tokio::time::timeout(self.effective_timeout(timeout), fut).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::SftpUnavailable)) => Err(Error::SftpUnavailable),
            Ok(Err(err)) => Err(self.fail_transport(err)),
            Err(_) => Err(self.fail_transport(Error::Timeout)),
        }
    }

    async fn sftp_put(
        &self,
        local_path: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Result<()> {
        let content = tokio::fs::read(local_path).await?;
        let _guard = self.op_lock.lock().await;
        debug!(local = %local_path.display(), remote_path, "sftp: uploading file");
        let fut = async {
            let sftp = self.open_sftp().await?;
            let mut file = sftp.create(remote_path).await.map_err(|e| Error::TransportLost {
                message: format!("sftp create failed: {e}"),
            })?;
            file.write_all(&content).await.map_err(|e| Error::TransportLost {
                message: format!("sftp write failed: {e}"),
            })?;
            file.shutdown().await.map_err(|e| Error::TransportLost {
                message: format!("sftp close failed: {e}"),
            })?;
            Ok(())
        };
        match tokio::time::timeout(self.effective_timeout(timeout), fut).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::SftpUnavailable)) => Err(Error::SftpUnavailable),
            Ok(Err(err)) => Err(self.fail_transport(err)),
            Err(_) => Err(self.fail_transport(Error::Timeout)),
        }
    }

    async fn sftp_remove(&self, remote_path: &str, timeout: Duration) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        debug!(remote_path, "sftp: removing remote file");
        let fut = async {
            let sftp = self.open_sftp().await?;
            sftp.remove_file(remote_path)
                .await
                .map_err(|e| Error::TransportLost {
                    message: format!("sftp remove failed: {e}"),
                })
        };
        match tokio::time::timeout(self.effective_timeout(timeout), fut).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::SftpUnavailable)) => Err(Error::SftpUnavailable),
            Ok(Err(err)) => Err(self.fail_transport(err)),
            Err(_) => Err(self.fail_transport(Error::Timeout)),
        }
    }

    async fn sftp_probe(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.open_sftp().await.map(|_| ())
    }

    async fn request_reverse_forward(&self, server_port: u16) -> Result<ForwardReceiver> {
        let receiver = self.router.register(server_port);
        let mut handle = self.handle.lock().await;
        let granted = handle
            .tcpip_forward("127.0.0.1", server_port as u32)
            .await
            .map_err(map_ssh_error)?;
        if !granted {
            self.router.unregister(server_port);
            return Err(Error::TunnelFailed {
                message: format!("server denied reverse forward for port {server_port}"),
            });
        }
        Ok(receiver)
    }

    async fn cancel_reverse_forward(&self, server_port: u16) -> Result<()> {
        self.router.unregister(server_port);
        let mut handle = self.handle.lock().await;
        let _ = handle
            .cancel_tcpip_forward("127.0.0.1", server_port as u32)
            .await;
        Ok(())
    }

    fn username(&self) -> String {
        self.username.clone()
    }

    fn peer_host(&self) -> String {
        self.peer_host.clone()
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }
}

fn map_ssh_error(err: russh::Error) -> Error {
    match err {
        russh::Error::NotAuthenticated => Error::AuthenticationFailed,
        russh::Error::UnknownKey => Error::AuthenticationFailed,
        other => Error::TransportLost {
            message: other.to_string(),
        },
    }
}

// =============================================================================
// Test transport
// =============================================================================

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! A scriptable [`CommandTransport`] double.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    type Response = std::result::Result<(String, String), &'static str>;

    struct Rule {
        needle: String,
        queue: VecDeque<Response>,
        sticky: Response,
    }

    /// Records every command and answers from per-command scripts.
    ///
    /// Responses for one command pattern are consumed in order; the last
    /// one becomes sticky and repeats forever.
    #[derive(Default)]
    pub struct MockTransport {
        rules: StdMutex<Vec<Rule>>,
        executed: StdMutex<Vec<String>>,
        sftp_ops: StdMutex<Vec<String>>,
        forwards: StdMutex<Vec<(u16, mpsc::UnboundedSender<Box<dyn ForwardStream>>)>>,
        dead: AtomicBool,
        pub fail_sftp: AtomicBool,
        username: String,
    }

    impl MockTransport {
        pub fn new() -> Self {
            MockTransport {
                username: "alice".into(),
                ..Default::default()
            }
        }

        /// Script a stdout response for commands containing `needle`.
        pub fn respond(&self, needle: &str, stdout: &str) {
            self.push_response(needle, Ok((stdout.to_owned(), String::new())));
        }

        /// Script a stdout+stderr response.
        pub fn respond_with_stderr(&self, needle: &str, stdout: &str, stderr: &str) {
            self.push_response(needle, Ok((stdout.to_owned(), stderr.to_owned())));
        }

        /// Script a transport failure for commands containing `needle`.
        pub fn fail(&self, needle: &str) {
            self.push_response(needle, Err("scripted failure"));
        }

        fn push_response(&self, needle: &str, response: Response) {
            let mut rules = self.rules.lock().unwrap();
            if let Some(rule) = rules.iter_mut().find(|r| r.needle == needle) {
                rule.queue.push_back(response);
            } else {
                rules.push(Rule {
                    needle: needle.to_owned(),
                    sticky: response.clone(),
                    queue: VecDeque::from([response]),
                });
            }
        }

        /// All commands executed so far.
        pub fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }

        /// All SFTP operations performed so far.
        pub fn sftp_ops(&self) -> Vec<String> {
            self.sftp_ops.lock().unwrap().clone()
        }

        /// Number of executions of commands containing `needle`.
        pub fn exec_count(&self, needle: &str) -> usize {
            self.executed
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.contains(needle))
                .count()
        }

        /// Ports with a currently registered reverse forward.
        pub fn forwarded_ports(&self) -> Vec<u16> {
            self.forwards.lock().unwrap().iter().map(|(p, _)| *p).collect()
        }

        /// Simulate a server-initiated connection on a forwarded port.
        ///
        /// Returns the server half of the in-memory stream pair, or `None`
        /// if nothing listens on that port.
        pub fn inject_connection(&self, port: u16) -> Option<tokio::io::DuplexStream> {
            let forwards = self.forwards.lock().unwrap();
            let (_, tx) = forwards.iter().find(|(p, _)| *p == port)?;
            let (client_half, server_half) = tokio::io::duplex(64 * 1024);
            tx.send(Box::new(client_half)).ok()?;
            Some(server_half)
        }
    }

    #[async_trait]
    impl CommandTransport for MockTransport {
        async fn exec(&self, cmd: &str, _timeout: Duration) -> Result<(String, String)> {
            if self.is_dead() {
                return Err(Error::SessionDead);
            }
            self.executed.lock().unwrap().push(cmd.to_owned());
            let response = {
                let mut rules = self.rules.lock().unwrap();
                match rules.iter_mut().find(|r| cmd.contains(&r.needle)) {
                    Some(rule) => {
                        if let Some(front) = rule.queue.pop_front() {
                            rule.sticky = front.clone();
                        }
                        rule.sticky.clone()
                    }
                    None => Ok((String::new(), String::new())),
                }
            };
            response.map_err(|msg| {
                self.mark_dead();
                Error::TransportLost {
                    message: msg.to_owned(),
                }
            })
        }

        async fn sftp_write(
            &self,
            remote_path: &str,
            _content: &str,
            _timeout: Duration,
        ) -> Result<()> {
            if self.fail_sftp.load(Ordering::SeqCst) {
                return Err(Error::SftpUnavailable);
            }
            self.sftp_ops.lock().unwrap().push(format!("write:{remote_path}"));
            Ok(())
        }

        async fn sftp_put(
            &self,
            local_path: &Path,
            remote_path: &str,
            _timeout: Duration,
        ) -> Result<()> {
            if self.fail_sftp.load(Ordering::SeqCst) {
                return Err(Error::SftpUnavailable);
            }
            self.sftp_ops
                .lock()
                .unwrap()
                .push(format!("put:{}:{remote_path}", local_path.display()));
            Ok(())
        }

        async fn sftp_remove(&self, remote_path: &str, _timeout: Duration) -> Result<()> {
            self.sftp_ops.lock().unwrap().push(format!("remove:{remote_path}"));
            Ok(())
        }

        async fn sftp_probe(&self) -> Result<()> {
            if self.fail_sftp.load(Ordering::SeqCst) {
                return Err(Error::SftpUnavailable);
            }
            Ok(())
        }

        async fn request_reverse_forward(&self, server_port: u16) -> Result<ForwardReceiver> {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut forwards = self.forwards.lock().unwrap();
            forwards.retain(|(p, _)| *p != server_port);
            forwards.push((server_port, tx));
            Ok(rx)
        }

        async fn cancel_reverse_forward(&self, server_port: u16) -> Result<()> {
            self.forwards.lock().unwrap().retain(|(p, _)| *p != server_port);
            Ok(())
        }

        fn username(&self) -> String {
            self.username.clone()
        }

        fn peer_host(&self) -> String {
            "testserver".into()
        }

        fn is_dead(&self) -> bool {
            self.dead.load(Ordering::SeqCst)
        }

        fn mark_dead(&self) {
            self.dead.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;

    #[tokio::test]
    async fn mock_replays_scripted_responses_in_order() {
        let transport = MockTransport::new();
        transport.respond("x2golistsessions", "first");
        transport.respond("x2golistsessions", "second");

        let (out, _) = transport
            .exec("x2golistsessions", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, "first");
        let (out, _) = transport
            .exec("x2golistsessions", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, "second");
        // last response is sticky
        let (out, _) = transport
            .exec("x2golistsessions", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, "second");
    }

    #[tokio::test]
    async fn mock_failure_marks_transport_dead() {
        let transport = MockTransport::new();
        transport.fail("echo");
        let err = transport.exec("echo", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::TransportLost { .. }));
        assert!(transport.is_dead());

        let err = transport.exec("echo", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::SessionDead));
    }

    #[tokio::test]
    async fn forward_router_dispatches_by_port() {
        let router = ForwardRouter::default();
        let mut rx = router.register(30002);
        let (a, _b) = tokio::io::duplex(16);
        assert!(router.dispatch(30002, Box::new(a)));
        assert!(rx.try_recv().is_ok());

        let (c, _d) = tokio::io::duplex(16);
        assert!(!router.dispatch(40000, Box::new(c)));

        router.unregister(30002);
        let (e, _f) = tokio::io::duplex(16);
        assert!(!router.dispatch(30002, Box::new(e)));
    }

    #[tokio::test]
    async fn mock_injects_forwarded_connections() {
        let transport = MockTransport::new();
        let mut rx = transport.request_reverse_forward(30002).await.unwrap();
        assert_eq!(transport.forwarded_ports(), vec![30002]);

        assert!(transport.inject_connection(30002).is_some());
        assert!(rx.recv().await.is_some());

        transport.cancel_reverse_forward(30002).await.unwrap();
        assert!(transport.inject_connection(30002).is_none());
    }
}
