//! Notification hooks fired towards the embedding application.
//!
//! Every failure class and lifecycle transition maps to exactly one hook
//! call with profile/session context. The default implementations log and
//! otherwise do nothing, so embedders only override what they render.

use tracing::warn;

use x2go_core::status::StatusEvent;

/// Callbacks invoked by sessions and the registry.
///
/// All methods have logged no-op defaults. Implementations must be cheap
/// and non-blocking; they are called from within engine tasks.
pub trait SessionHooks: Send + Sync {
    /// The control session of a profile died unexpectedly.
    fn on_control_session_death(&self, profile_name: &str) {
        warn!(profile = profile_name, "control session died unexpectedly");
    }

    /// The transport cannot provide an SFTP channel; new sessions for this
    /// profile will lack folder sharing, printing and the MIME box.
    fn on_sftp_unavailable(&self, profile_name: &str) {
        warn!(
            profile = profile_name,
            "SFTP client unavailable, check server setup (avoid echoing ~/.bashrc on server)"
        );
    }

    /// Session startup failed.
    fn on_startup_failed(&self, profile_name: &str) {
        warn!(profile = profile_name, "session startup failed");
    }

    /// Desktop sharing was declined by the session owner.
    fn on_sharing_denied(&self, profile_name: &str) {
        warn!(profile = profile_name, "desktop sharing denied by remote user");
    }

    /// The configured session command does not exist on the server.
    fn on_no_such_command(&self, profile_name: &str, session_name: &str, cmd: &str) {
        warn!(
            profile = profile_name,
            session = session_name,
            cmd, "command not available on server"
        );
    }

    /// The server-side desktop listing took too long; retrying is fine.
    fn on_list_desktops_timeout(&self, profile_name: &str) {
        warn!(profile = profile_name, "x2golistdesktops took too long, try again");
    }

    /// A reverse port-forward request was denied by the server.
    fn on_rforward_request_denied(&self, profile_name: &str, session_name: &str, server_port: u16) {
        warn!(
            profile = profile_name,
            session = session_name,
            server_port, "reverse TCP port forwarding request denied by server"
        );
    }

    /// A forwarding tunnel could not reach its local target.
    fn on_forwarding_tunnel_failed(&self, profile_name: &str, session_name: &str, port: u16) {
        warn!(
            profile = profile_name,
            session = session_name,
            port, "forwarding tunnel setup failed"
        );
    }

    /// Sound is unavailable for this session.
    fn on_sound_not_available(&self, profile_name: &str, session_name: &str) {
        warn!(profile = profile_name, session = session_name, "session sound unavailable");
    }

    /// Client-side printing is unavailable for this session.
    fn on_printing_not_available(&self, profile_name: &str, session_name: &str) {
        warn!(profile = profile_name, session = session_name, "client-side printing unavailable");
    }

    /// The MIME box is unavailable for this session.
    fn on_mimebox_not_available(&self, profile_name: &str, session_name: &str) {
        warn!(profile = profile_name, session = session_name, "MIME box unavailable");
    }

    /// Client-side folder sharing is unavailable for this session.
    fn on_foldersharing_not_available(&self, profile_name: &str, session_name: &str) {
        warn!(profile = profile_name, session = session_name, "folder sharing unavailable");
    }

    /// SSHFS access was denied by the server; folder sharing, printing and
    /// the MIME box will all be unavailable.
    fn on_sshfs_not_available(&self, profile_name: &str, session_name: &str) {
        warn!(profile = profile_name, session = session_name, "server denies SSHFS access");
    }

    /// One per-session lifecycle transition (started/resumed/suspended/
    /// terminated, by me or by another client).
    fn on_session_event(&self, profile_name: &str, session_name: &str, event: StatusEvent) {
        tracing::info!(profile = profile_name, session = session_name, ?event, "session event");
    }

    /// Host-key acceptance callback.
    ///
    /// Return `true` to accept the presented key. The default rejects
    /// unknown keys.
    fn accept_host_key(&self, host: &str, port: u16, fingerprint: &str) -> bool {
        warn!(host, port, fingerprint, "rejecting unknown host key");
        false
    }
}

/// The hooks used when the embedder does not supply any.
#[derive(Debug, Default)]
pub struct DefaultHooks;

impl SessionHooks for DefaultHooks {}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Hook recorder for tests.
    #[derive(Default)]
    pub struct RecordingHooks {
        pub events: Mutex<Vec<String>>,
        pub accept_keys: bool,
    }

    impl RecordingHooks {
        pub fn new(accept_keys: bool) -> Self {
            RecordingHooks {
                events: Mutex::new(Vec::new()),
                accept_keys,
            }
        }

        pub fn record(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        pub fn recorded(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl SessionHooks for RecordingHooks {
        fn on_control_session_death(&self, profile_name: &str) {
            self.record(format!("control_session_death:{profile_name}"));
        }
        fn on_sftp_unavailable(&self, profile_name: &str) {
            self.record(format!("sftp_unavailable:{profile_name}"));
        }
        fn on_startup_failed(&self, profile_name: &str) {
            self.record(format!("startup_failed:{profile_name}"));
        }
        fn on_sharing_denied(&self, profile_name: &str) {
            self.record(format!("sharing_denied:{profile_name}"));
        }
        fn on_no_such_command(&self, profile_name: &str, _session_name: &str, cmd: &str) {
            self.record(format!("no_such_command:{profile_name}:{cmd}"));
        }
        fn on_rforward_request_denied(&self, _p: &str, session_name: &str, server_port: u16) {
            self.record(format!("rforward_denied:{session_name}:{server_port}"));
        }
        fn on_forwarding_tunnel_failed(&self, _p: &str, session_name: &str, port: u16) {
            self.record(format!("forwarding_tunnel_failed:{session_name}:{port}"));
        }
        fn on_sound_not_available(&self, _p: &str, session_name: &str) {
            self.record(format!("sound_unavailable:{session_name}"));
        }
        fn on_printing_not_available(&self, _p: &str, session_name: &str) {
            self.record(format!("printing_unavailable:{session_name}"));
        }
        fn on_mimebox_not_available(&self, _p: &str, session_name: &str) {
            self.record(format!("mimebox_unavailable:{session_name}"));
        }
        fn on_sshfs_not_available(&self, _p: &str, session_name: &str) {
            self.record(format!("sshfs_unavailable:{session_name}"));
        }
        fn on_session_event(&self, _p: &str, session_name: &str, event: StatusEvent) {
            self.record(format!("event:{session_name}:{event:?}"));
        }
        fn accept_host_key(&self, _host: &str, _port: u16, _fingerprint: &str) -> bool {
            self.accept_keys
        }
    }
}
