//! Collaborator contracts and connection options.
//!
//! The profile store, SSH proxy, print/MIME-box queues and the graphics
//! proxy are external subsystems. They are consumed through the narrow
//! traits defined here and never implemented inside the engine.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use zeroize::{Zeroize, ZeroizeOnDrop};

use x2go_core::listing::SessionInfo;
use x2go_core::Result;

/// Opaque key/value source for session profiles.
pub trait ProfileStore: Send + Sync {
    /// Look up one profile option.
    fn get(&self, profile_id: &str, key: &str) -> Option<String>;

    /// Resolve the server hostname of a profile.
    fn server_hostname(&self, profile_id: &str) -> Option<String>;

    /// Resolve the server SSH port of a profile.
    fn server_port(&self, profile_id: &str) -> u16 {
        let _ = profile_id;
        22
    }

    /// The folders a profile wants shared, mapped to an enabled flag.
    fn exported_folders(&self, profile_id: &str) -> HashMap<String, bool> {
        let _ = profile_id;
        HashMap::new()
    }
}

/// Credential material for one connect attempt.
///
/// Zeroed on drop; the engine additionally scrubs it right after every
/// connect attempt regardless of outcome.
#[derive(Debug, Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub password: Option<String>,
    pub passphrase: Option<String>,
}

impl Credentials {
    /// Scrub all secret material in place.
    pub fn scrub(&mut self) {
        self.zeroize();
    }
}

/// Authentication and transport options for a control session connect.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// User name to authenticate as; mandatory.
    pub username: String,
    /// Password / key passphrase material.
    pub credentials: Credentials,
    /// Explicit private key file to try first.
    pub key_filename: Option<PathBuf>,
    /// Search `~/.ssh` for discoverable keys.
    pub look_for_keys: bool,
    /// Ask a local SSH agent for identities.
    pub allow_agent: bool,
    /// Skip key authentication entirely, go straight to the password.
    pub force_password_auth: bool,
    /// Accept unknown host keys without asking the host-key callback.
    pub add_to_known_hosts: bool,
    /// Request SSH agent forwarding on the control transport.
    pub forward_agent: bool,
    /// Double all command deadlines (weak links).
    pub low_latency: bool,
    /// Tunnel the connection through an intermediate SSH proxy.
    pub proxy: Option<ProxyOptions>,
}

/// Options for the intermediate SSH proxy hop.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub key_filename: Option<PathBuf>,
    /// Re-use the target session's credentials for the proxy hop.
    pub reuse_auth_info: bool,
}

impl ConnectOptions {
    /// Scrub all credential material, proxy credentials included.
    pub fn scrub_credentials(&mut self) {
        self.credentials.scrub();
        if let Some(proxy) = self.proxy.as_mut() {
            proxy.credentials.scrub();
        }
    }
}

/// The intermediate SSH proxy subsystem.
///
/// Started before the real connect; the control session then connects to
/// `local_host():local_port()` instead of the configured server.
#[async_trait]
pub trait SshProxy: Send + Sync {
    /// Bring up the local forwarding endpoint.
    async fn start(&self) -> Result<()>;

    /// Tear the proxy down, closing the local endpoint.
    async fn stop(&self);

    /// Local address the forwarded port listens on.
    fn local_host(&self) -> String;

    /// Local forwarded port (may change after reconnects).
    fn local_port(&self) -> u16;
}

/// The client-side print-job queue subsystem.
pub trait PrintQueue: Send + Sync {
    /// Start watching the given spool directory.
    fn start(&self, spool_dir: &str) -> Result<()>;

    /// Stop accepting new jobs.
    fn pause(&self);

    /// Change the action applied to incoming jobs.
    fn set_action(&self, action: &str);
}

/// The client-side MIME-box queue subsystem.
pub trait MimeboxQueue: Send + Sync {
    /// Start watching the given MIME-box directory.
    fn start(&self, mimebox_dir: &str, extensions: &[String]) -> Result<()>;

    /// Stop accepting new files.
    fn pause(&self);

    /// Change the action applied to incoming files.
    fn set_action(&self, action: &str);
}

/// Handle on a started graphics proxy subprocess.
pub trait ProxyProcess: Send + Sync {
    /// True while the proxy subprocess is alive and serving the session.
    fn ok(&self) -> bool;

    /// Stop the subprocess.
    fn stop(&self);
}

/// Launcher for the external graphics proxy (NX proxy or compatible).
pub trait GraphicsProxyLauncher: Send + Sync {
    /// Spawn the proxy subprocess for a started/resumed session.
    fn start_proxy(
        &self,
        info: &SessionInfo,
        sessions_rootdir: &str,
    ) -> Result<Box<dyn ProxyProcess>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// In-memory profile store for tests.
    #[derive(Default)]
    pub struct MapProfileStore {
        pub options: HashMap<(String, String), String>,
        pub exports: HashMap<String, HashMap<String, bool>>,
    }

    impl ProfileStore for MapProfileStore {
        fn get(&self, profile_id: &str, key: &str) -> Option<String> {
            self.options
                .get(&(profile_id.to_owned(), key.to_owned()))
                .cloned()
        }

        fn server_hostname(&self, profile_id: &str) -> Option<String> {
            self.get(profile_id, "host")
        }

        fn exported_folders(&self, profile_id: &str) -> HashMap<String, bool> {
            self.exports.get(profile_id).cloned().unwrap_or_default()
        }
    }

    /// Graphics proxy double whose liveness can be toggled.
    pub struct FakeProxyProcess {
        pub alive: Arc<AtomicBool>,
    }

    impl ProxyProcess for FakeProxyProcess {
        fn ok(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn stop(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    pub struct FakeProxyLauncher {
        pub succeed: bool,
        pub alive: Arc<AtomicBool>,
    }

    impl Default for FakeProxyLauncher {
        fn default() -> Self {
            FakeProxyLauncher {
                succeed: true,
                alive: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    impl GraphicsProxyLauncher for FakeProxyLauncher {
        fn start_proxy(
            &self,
            _info: &SessionInfo,
            _sessions_rootdir: &str,
        ) -> Result<Box<dyn ProxyProcess>> {
            if self.succeed {
                self.alive.store(true, Ordering::SeqCst);
                Ok(Box::new(FakeProxyProcess {
                    alive: Arc::clone(&self.alive),
                }))
            } else {
                Err(x2go_core::Error::StartupFailed {
                    message: "proxy refused to start".into(),
                })
            }
        }
    }

    #[test]
    fn credentials_scrub_clears_material() {
        let mut creds = Credentials {
            password: Some("secret".into()),
            passphrase: Some("unlock".into()),
        };
        creds.scrub();
        assert!(creds.password.is_none());
        assert!(creds.passphrase.is_none());
    }

    #[test]
    fn connect_options_scrub_reaches_proxy() {
        let mut opts = ConnectOptions {
            credentials: Credentials {
                password: Some("a".into()),
                passphrase: None,
            },
            proxy: Some(ProxyOptions {
                credentials: Credentials {
                    password: Some("b".into()),
                    passphrase: None,
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        opts.scrub_credentials();
        assert!(opts.credentials.password.is_none());
        assert!(opts.proxy.unwrap().credentials.password.is_none());
    }
}
