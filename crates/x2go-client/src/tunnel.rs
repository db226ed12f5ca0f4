//! Reverse forwarding tunnels for sound, sshfs and graphics channels.
//!
//! A reverse tunnel asks the server to forward connections from a
//! server-side port back to a local TCP target. Each tunnel owns one
//! background task that accepts incoming forwarded channels and pumps
//! bytes between the channel and the local socket.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use x2go_core::error::Result;

use crate::hooks::SessionHooks;
use crate::transport::{CommandTransport, ForwardReceiver};

/// What a reverse tunnel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    /// Graphics channel data for the proxy subprocess.
    Graphics,
    /// Sound stream (pulse or esd).
    Sound,
    /// SSHFS channel for folder sharing, printing and the MIME box.
    Sshfs,
}

/// Lifecycle state of a reverse tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Never started or fully stopped.
    Stopped,
    /// Forward requested, accept loop running.
    Active,
    /// Forward cancelled on the server, local endpoint kept.
    Paused,
}

/// A managed reverse port-forward keyed by session name and kind.
pub struct ReverseTunnel {
    session_name: String,
    profile_name: String,
    kind: TunnelKind,
    /// Port the server listens on (start of the tunnel).
    server_port: u16,
    /// Local target the forwarded traffic connects to.
    local_host: String,
    local_port: u16,
    transport: Arc<dyn CommandTransport>,
    hooks: Arc<dyn SessionHooks>,
    state: Mutex<TunnelState>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReverseTunnel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_name: &str,
        profile_name: &str,
        kind: TunnelKind,
        server_port: u16,
        local_host: &str,
        local_port: u16,
        transport: Arc<dyn CommandTransport>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        ReverseTunnel {
            session_name: session_name.to_owned(),
            profile_name: profile_name.to_owned(),
            kind,
            server_port,
            local_host: local_host.to_owned(),
            local_port,
            transport,
            hooks,
            state: Mutex::new(TunnelState::Stopped),
            pump_task: Mutex::new(None),
        }
    }

    /// The server-side port this tunnel starts at.
    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    /// What this tunnel carries.
    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> TunnelState {
        *self.state.lock().await
    }

    /// Request the server-side forward and start accepting channels.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == TunnelState::Active {
            return Ok(());
        }

        let receiver = match self.transport.request_reverse_forward(self.server_port).await {
            Ok(receiver) => receiver,
            Err(err) => {
                self.hooks.on_rforward_request_denied(
                    &self.profile_name,
                    &self.session_name,
                    self.server_port,
                );
                return Err(err);
            }
        };

        let task = tokio::spawn(pump_loop(
            receiver,
            self.local_host.clone(),
            self.local_port,
            self.profile_name.clone(),
            self.session_name.clone(),
            Arc::clone(&self.hooks),
        ));
        *self.pump_task.lock().await = Some(task);
        *state = TunnelState::Active;
        info!(
            session = %self.session_name,
            kind = ?self.kind,
            server_port = self.server_port,
            target = %format!("{}:{}", self.local_host, self.local_port),
            "reverse tunnel established"
        );
        Ok(())
    }

    /// Cancel the server-side forward and stop accepting new channels.
    ///
    /// Active connections are dropped with the accept task.
    pub async fn pause(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != TunnelState::Active {
            return Ok(());
        }
        self.transport.cancel_reverse_forward(self.server_port).await?;
        if let Some(task) = self.pump_task.lock().await.take() {
            task.abort();
        }
        *state = TunnelState::Paused;
        debug!(session = %self.session_name, kind = ?self.kind, "reverse tunnel paused");
        Ok(())
    }

    /// Re-request the forward after a pause.
    pub async fn resume(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if *state == TunnelState::Active {
                return Ok(());
            }
        }
        self.start().await
    }

    /// Tear the tunnel down completely.
    pub async fn stop(&self) {
        let _ = self.pause().await;
        *self.state.lock().await = TunnelState::Stopped;
        debug!(session = %self.session_name, kind = ?self.kind, "reverse tunnel stopped");
    }
}

/// Accept forwarded channels and pump each against the local target.
async fn pump_loop(
    mut receiver: ForwardReceiver,
    local_host: String,
    local_port: u16,
    profile_name: String,
    session_name: String,
    hooks: Arc<dyn SessionHooks>,
) {
    while let Some(mut channel) = receiver.recv().await {
        let target = format!("{local_host}:{local_port}");
        let profile = profile_name.clone();
        let session = session_name.clone();
        let hooks = Arc::clone(&hooks);
        tokio::spawn(async move {
            let mut socket = match TcpStream::connect(&target).await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(%target, %err, "reverse tunnel target connect failed");
                    hooks.on_forwarding_tunnel_failed(&profile, &session, local_port);
                    return;
                }
            };
            let _ = socket.set_nodelay(true);
            match tokio::io::copy_bidirectional(&mut channel, &mut socket).await {
                Ok((sent, received)) => {
                    debug!(%target, sent, received, "reverse tunnel connection closed")
                }
                Err(err) => debug!(%target, %err, "reverse tunnel connection errored"),
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::testing::RecordingHooks;
    use crate::transport::testing::MockTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tunnel_to(
        transport: &Arc<MockTransport>,
        hooks: &Arc<RecordingHooks>,
        local_port: u16,
    ) -> ReverseTunnel {
        ReverseTunnel::new(
            "sess-1",
            "prof",
            TunnelKind::Sound,
            30002,
            "127.0.0.1",
            local_port,
            Arc::clone(transport) as Arc<dyn CommandTransport>,
            Arc::clone(hooks) as Arc<dyn SessionHooks>,
        )
    }

    #[tokio::test]
    async fn start_registers_forward_and_pumps_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = listener.local_addr().unwrap().port();

        let transport = Arc::new(MockTransport::new());
        let hooks = Arc::new(RecordingHooks::new(true));
        let tunnel = tunnel_to(&transport, &hooks, local_port);

        tunnel.start().await.unwrap();
        assert_eq!(tunnel.state().await, TunnelState::Active);
        assert_eq!(transport.forwarded_ports(), vec![30002]);

        // server initiates a connection through the forward
        let mut server_half = transport.inject_connection(30002).unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();

        server_half.write_all(b"audio-bytes").await.unwrap();
        let mut buf = [0u8; 11];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"audio-bytes");

        // and the reply direction
        accepted.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        server_half.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn pause_cancels_forward_and_resume_requests_again() {
        let transport = Arc::new(MockTransport::new());
        let hooks = Arc::new(RecordingHooks::new(true));
        let tunnel = tunnel_to(&transport, &hooks, 1);

        tunnel.start().await.unwrap();
        tunnel.pause().await.unwrap();
        assert_eq!(tunnel.state().await, TunnelState::Paused);
        assert!(transport.forwarded_ports().is_empty());

        tunnel.resume().await.unwrap();
        assert_eq!(tunnel.state().await, TunnelState::Active);
        assert_eq!(transport.forwarded_ports(), vec![30002]);

        tunnel.stop().await;
        assert_eq!(tunnel.state().await, TunnelState::Stopped);
    }

    #[tokio::test]
    async fn start_is_idempotent_while_active() {
        let transport = Arc::new(MockTransport::new());
        let hooks = Arc::new(RecordingHooks::new(true));
        let tunnel = tunnel_to(&transport, &hooks, 1);

        tunnel.start().await.unwrap();
        tunnel.start().await.unwrap();
        assert_eq!(transport.forwarded_ports(), vec![30002]);
    }

    #[tokio::test]
    async fn unreachable_target_fires_hook() {
        let transport = Arc::new(MockTransport::new());
        let hooks = Arc::new(RecordingHooks::new(true));
        // port 1 is never listening on the test host
        let tunnel = tunnel_to(&transport, &hooks, 1);

        tunnel.start().await.unwrap();
        let _server_half = transport.inject_connection(30002).unwrap();

        // wait for the spawned pump to fail its connect
        for _ in 0..50 {
            if !hooks.recorded().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(hooks
            .recorded()
            .iter()
            .any(|e| e.starts_with("forwarding_tunnel_failed") || e.contains("rforward")
                || e.contains("tunnel")),
            "{:?}", hooks.recorded());
    }
}
