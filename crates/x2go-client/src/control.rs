//! The control session: one authenticated SSH connection per profile and
//! the text command protocol layered on it.
//!
//! A control session is shared by all terminal sessions of one profile.
//! It owns server feature/version discovery, session listing with its
//! corrupt-output retry policy, the suspend/terminate dispatch and the
//! published-applications menu cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use x2go_core::constants::{
    self, CMD_FEATURE_LIST, CMD_GET_APPS, CMD_LIST_DESKTOPS, CMD_LIST_MOUNTS, CMD_LIST_SESSIONS,
    CMD_LIST_SHADOW_SESSIONS, CMD_SUSPEND_SESSION, CMD_TERMINATE_SESSION, CMD_VERSION,
    FEATURE_LIST_SHADOW_SESSIONS, FEATURE_PUBLISHED_APPLICATIONS,
};
use x2go_core::error::{Error, Result};
use x2go_core::listing::{parse_session_list, SessionInfo};
use x2go_core::pubapps::{self, MenuTree};

use crate::config::{ConnectOptions, SshProxy};
use crate::hooks::SessionHooks;
use crate::transport::{AuthRung, CommandTransport, TransportChannel};

/// Retry policy for corrupt session listings.
///
/// Partial listings are a known race in the server's session database
/// scripts; the listing is retried with a bounded backoff before the
/// control session is declared dead.
#[derive(Debug, Clone, Copy)]
pub struct ListingRetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for ListingRetryPolicy {
    fn default() -> Self {
        ListingRetryPolicy {
            attempts: constants::LISTING_RETRY_ATTEMPTS,
            backoff: constants::LISTING_RETRY_BACKOFF,
        }
    }
}

/// One authenticated SSH connection and the x2go command protocol on it.
pub struct ControlSession {
    profile_name: std::sync::Mutex<String>,
    transport: std::sync::Mutex<Option<Arc<dyn CommandTransport>>>,
    hooks: Arc<dyn SessionHooks>,
    retry_policy: ListingRetryPolicy,
    exec_timeout: Duration,

    // discovery caches, invalidated only on explicit force
    server_features: Mutex<Option<Vec<String>>>,
    server_versions: Mutex<Option<HashMap<String, String>>>,
    remote_home: Mutex<Option<String>>,

    // published-applications menu, cached per locale
    pubapps_menu: Mutex<HashMap<String, MenuTree>>,
    pubapps_query_lock: Mutex<()>,
}

impl ControlSession {
    /// Create an unconnected control session for a profile.
    pub fn new(profile_name: &str, hooks: Arc<dyn SessionHooks>) -> Self {
        ControlSession {
            profile_name: std::sync::Mutex::new(profile_name.to_owned()),
            transport: std::sync::Mutex::new(None),
            hooks,
            retry_policy: ListingRetryPolicy::default(),
            exec_timeout: constants::EXEC_TIMEOUT,
            server_features: Mutex::new(None),
            server_versions: Mutex::new(None),
            remote_home: Mutex::new(None),
            pubapps_menu: Mutex::new(HashMap::new()),
            pubapps_query_lock: Mutex::new(()),
        }
    }

    /// Override the corrupt-listing retry policy.
    pub fn with_retry_policy(mut self, policy: ListingRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Attach an already-connected transport (used by tests and by the
    /// registry when cloning backend configuration).
    pub fn attach_transport(&self, transport: Arc<dyn CommandTransport>) {
        *self.transport.lock().unwrap() = Some(transport);
    }

    /// The profile this control session serves.
    pub fn profile_name(&self) -> String {
        self.profile_name.lock().unwrap().clone()
    }

    /// Rename the owning profile.
    pub fn set_profile_name(&self, profile_name: &str) {
        *self.profile_name.lock().unwrap() = profile_name.to_owned();
    }

    /// Connect to the server and authenticate.
    ///
    /// Authentication is attempted in order: an explicit key (file), key
    /// discovery / agent identities, then plain password. When only a
    /// password rung exists and the password is empty, a random throwaway
    /// password is generated so the host-key validation still runs before
    /// the (failing) auth step. When an SSH proxy is supplied the real
    /// host/port are rewritten to the proxy's local forwarding endpoint
    /// before connecting.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        mut options: ConnectOptions,
        proxy: Option<Arc<dyn SshProxy>>,
    ) -> Result<bool> {
        let result = self.connect_inner(host, port, &options, proxy).await;
        // credential material is scrubbed regardless of outcome
        options.scrub_credentials();
        result
    }

    async fn connect_inner(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
        proxy: Option<Arc<dyn SshProxy>>,
    ) -> Result<bool> {
        if options.username.is_empty() {
            warn!("no username specified, cannot connect without username");
            return Err(Error::AuthenticationFailed);
        }

        // trailing whitespace tolerance, IPv4 enforcement for localhost
        let mut host = host.trim().to_owned();
        if host == "localhost" || host == "localhost.localdomain" {
            host = "127.0.0.1".into();
        }
        let mut port = port;

        if let Some(proxy) = proxy.as_ref() {
            proxy.start().await.map_err(|e| match e {
                Error::AuthenticationFailed | Error::PasswordRequired => Error::ProxyAuthFailed,
                other => Error::ProxyFailed {
                    message: other.to_string(),
                },
            })?;
            host = proxy.local_host();
            port = proxy.local_port();
            debug!(host = %host, port, "diverting connection through ssh proxy");
        }

        let rungs = build_auth_rungs(options)?;

        info!(host = %host, port, profile = %self.profile_name(), "connecting control session");
        let transport = TransportChannel::connect(
            &host,
            port,
            &options.username,
            rungs,
            options.add_to_known_hosts,
            options.forward_agent,
            options.low_latency,
            Arc::clone(&self.hooks),
            proxy,
        )
        .await?;
        self.attach_transport(Arc::new(transport));

        // fresh connection, fresh caches
        *self.remote_home.lock().await = None;
        *self.server_features.lock().await = None;
        *self.server_versions.lock().await = None;

        if !self.home_exists().await? {
            self.disconnect().await;
            return Err(Error::RemoteHomeMissing);
        }
        self.query_server_features(true).await?;

        Ok(true)
    }

    fn transport(&self) -> Result<Arc<dyn CommandTransport>> {
        self.transport
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::SessionDead)
    }

    /// The underlying transport, for terminal sessions opening tunnels.
    pub fn transport_handle(&self) -> Option<Arc<dyn CommandTransport>> {
        self.transport.lock().unwrap().clone()
    }

    /// True while an authenticated, live transport is attached.
    pub fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_dead())
    }

    /// The SSH-authenticated remote user name.
    pub fn remote_username(&self) -> Result<String> {
        Ok(self.transport()?.username())
    }

    /// The remote peer host of the transport.
    pub fn remote_peername(&self) -> Result<String> {
        Ok(self.transport()?.peer_host())
    }

    /// Execute a server command under the transport mutex.
    pub async fn execute(&self, cmd: &str, timeout: Duration) -> Result<(String, String)> {
        self.transport()?.exec(cmd, timeout).await
    }

    /// Execute with the default exec deadline.
    pub async fn execute_default(&self, cmd: &str) -> Result<(String, String)> {
        self.execute(cmd, self.exec_timeout).await
    }

    /// Create a server-side text file over SFTP.
    pub async fn sftp_write(&self, remote_path: &str, content: &str) -> Result<()> {
        self.transport()?
            .sftp_write(remote_path, content, self.exec_timeout)
            .await
    }

    /// Upload a local file over SFTP.
    pub async fn sftp_put(&self, local_path: &std::path::Path, remote_path: &str) -> Result<()> {
        self.transport()?
            .sftp_put(local_path, remote_path, self.exec_timeout)
            .await
    }

    /// Remove a server-side file over SFTP.
    pub async fn sftp_remove(&self, remote_path: &str) -> Result<()> {
        self.transport()?
            .sftp_remove(remote_path, self.exec_timeout)
            .await
    }

    /// Probe the SFTP subsystem.
    pub async fn test_sftp(&self) -> Result<()> {
        self.transport()?.sftp_probe().await
    }

    /// Retrieve (and cache) the remote home directory.
    pub async fn remote_home(&self) -> Result<String> {
        let mut cache = self.remote_home.lock().await;
        if let Some(home) = cache.as_ref() {
            return Ok(home.clone());
        }
        let (stdout, _) = self.execute_default("echo $HOME").await?;
        let home = stdout
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_owned();
        debug!(home = %home, "resolved remote home directory");
        *cache = Some(home.clone());
        Ok(home)
    }

    /// Test whether the remote home directory exists.
    pub async fn home_exists(&self) -> Result<bool> {
        let home = self.remote_home().await?;
        if home.is_empty() {
            return Ok(false);
        }
        let (stdout, _) = self
            .execute_default(&format!("stat -tL \"{home}\""))
            .await?;
        Ok(!stdout.trim().is_empty())
    }

    /// Query the cached server feature list.
    pub async fn query_server_features(&self, force: bool) -> Result<Vec<String>> {
        let mut cache = self.server_features.lock().await;
        if force {
            *cache = None;
        }
        if let Some(features) = cache.as_ref() {
            return Ok(features.clone());
        }
        let (stdout, _) = self
            .execute_default(&format!("which {CMD_FEATURE_LIST} >/dev/null && {CMD_FEATURE_LIST}"))
            .await?;
        let mut features: Vec<String> = stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        features.sort();
        debug!(?features, "server-side feature list");
        *cache = Some(features.clone());
        Ok(features)
    }

    /// True if the server advertises `feature`.
    pub async fn has_feature(&self, feature: &str) -> Result<bool> {
        Ok(self
            .query_server_features(false)
            .await?
            .iter()
            .any(|f| f == feature))
    }

    /// Query the cached component version map.
    pub async fn query_server_versions(&self, force: bool) -> Result<HashMap<String, String>> {
        let mut cache = self.server_versions.lock().await;
        if force {
            *cache = None;
        }
        if let Some(versions) = cache.as_ref() {
            return Ok(versions.clone());
        }
        let (stdout, _) = self
            .execute_default(&format!("which {CMD_VERSION} >/dev/null && {CMD_VERSION}"))
            .await?;
        let mut versions = HashMap::new();
        for line in stdout.lines() {
            if let Some((component, version)) = line.split_once(':') {
                versions.insert(component.trim().to_owned(), version.trim().to_owned());
            }
        }
        debug!(?versions, "server-side component versions");
        *cache = Some(versions.clone());
        Ok(versions)
    }

    /// List all sessions of the current user, keyed by session name.
    ///
    /// Corrupt output is retried per the configured policy; exhausting it
    /// marks the control session dead and raises `ListingCorrupted`.
    pub async fn list_sessions(&self) -> Result<HashMap<String, SessionInfo>> {
        let cmd = if self.has_feature(FEATURE_LIST_SHADOW_SESSIONS).await? {
            format!("export HOSTNAME && {{ {CMD_LIST_SESSIONS}; {CMD_LIST_SHADOW_SESSIONS}; }}")
        } else {
            format!("export HOSTNAME && {CMD_LIST_SESSIONS}")
        };

        for attempt in 1..=self.retry_policy.attempts {
            let (stdout, _) = self.execute_default(&cmd).await?;
            match parse_session_list(&stdout) {
                Ok(sessions) => return Ok(sessions),
                Err(err) => {
                    debug!(attempt, %err, "corrupt session listing, retrying");
                    tokio::time::sleep(self.retry_policy.backoff).await;
                }
            }
        }

        if let Ok(transport) = self.transport() {
            transport.mark_dead();
        }
        self.disconnect().await;
        Err(Error::ListingCorrupted {
            attempts: self.retry_policy.attempts,
        })
    }

    /// Raw `x2golistsessions` output, unparsed.
    pub async fn list_sessions_raw(&self) -> Result<(String, String)> {
        let cmd = if self.has_feature(FEATURE_LIST_SHADOW_SESSIONS).await? {
            format!("export HOSTNAME && {{ {CMD_LIST_SESSIONS}; {CMD_LIST_SHADOW_SESSIONS}; }}")
        } else {
            format!("export HOSTNAME && {CMD_LIST_SESSIONS}")
        };
        self.execute_default(&cmd).await
    }

    /// List sharable desktop sessions.
    ///
    /// Uses the list-class timeout: expiry raises `ListTimeout` and leaves
    /// the transport alive, as transient empty listings are an expected
    /// server quirk.
    pub async fn list_desktops(&self) -> Result<Vec<String>> {
        let transport = self.transport()?;
        let cmd = format!("export HOSTNAME && {CMD_LIST_DESKTOPS}");
        let fut = transport.exec(&cmd, constants::LIST_TIMEOUT * 2);
        match tokio::time::timeout(constants::LIST_TIMEOUT, fut).await {
            Ok(result) => {
                let (stdout, _) = result?;
                Ok(stdout.lines().filter(|l| !l.is_empty()).map(str::to_owned).collect())
            }
            Err(_) => Err(Error::ListTimeout {
                command: CMD_LIST_DESKTOPS,
            }),
        }
    }

    /// List the client-side mounts of one session.
    pub async fn list_mounts(&self, session_name: &str) -> Result<Vec<String>> {
        let transport = self.transport()?;
        let cmd = format!("export HOSTNAME && {CMD_LIST_MOUNTS} {session_name}");
        let fut = transport.exec(&cmd, constants::LIST_TIMEOUT * 2);
        match tokio::time::timeout(constants::LIST_TIMEOUT, fut).await {
            Ok(result) => {
                let (stdout, _) = result?;
                Ok(stdout.lines().filter(|l| !l.is_empty()).map(str::to_owned).collect())
            }
            Err(_) => Err(Error::ListTimeout {
                command: CMD_LIST_MOUNTS,
            }),
        }
    }

    /// Suspend a session on the server. Best-effort.
    pub async fn suspend(&self, session_name: &str) -> Result<bool> {
        debug!(session = session_name, "suspending session");
        self.execute_default(&format!("{CMD_SUSPEND_SESSION} {session_name}"))
            .await?;
        Ok(true)
    }

    /// Terminate a session on the server. Best-effort.
    pub async fn terminate(&self, session_name: &str) -> Result<bool> {
        debug!(session = session_name, "terminating session");
        self.execute_default(&format!("{CMD_TERMINATE_SESSION} {session_name}"))
            .await?;
        Ok(true)
    }

    /// Terminate every session of the connected user.
    ///
    /// Published-applications provider sessions are kept unless
    /// `published_applications` is set.
    pub async fn clean_sessions(&self, published_applications: bool) -> Result<()> {
        let sessions = self.list_sessions().await?;
        for (name, info) in &sessions {
            if !published_applications && info.is_published_applications_provider() {
                continue;
            }
            self.terminate(name).await?;
        }
        Ok(())
    }

    /// Retrieve the published-applications menu tree for a locale.
    ///
    /// The result is cached per locale until `refresh` is requested. A
    /// single in-flight query is enforced per control session.
    pub async fn get_published_applications(
        &self,
        lang: &str,
        refresh: bool,
        max_submenus: usize,
    ) -> Result<MenuTree> {
        let _query_guard = self.pubapps_query_lock.lock().await;

        if !self.has_feature(FEATURE_PUBLISHED_APPLICATIONS).await? {
            return Ok(MenuTree::new());
        }

        {
            let cache = self.pubapps_menu.lock().await;
            if !refresh {
                if let Some(menu) = cache.get(lang) {
                    return Ok(menu.clone());
                }
            }
        }

        info!(profile = %self.profile_name(), lang, "querying published applications");
        let (stdout, _) = self
            .execute_default(&format!("which {CMD_GET_APPS} >/dev/null && {CMD_GET_APPS}"))
            .await?;
        let items = pubapps::split_raw_menu(&stdout);
        let menu = pubapps::build_menu(&items, lang, max_submenus);
        self.pubapps_menu
            .lock()
            .await
            .insert(lang.to_owned(), menu.clone());
        Ok(menu)
    }

    /// Raw `x2gogetapps` output split into desktop/icon elements.
    pub async fn get_published_applications_raw(&self) -> Result<Vec<pubapps::RawMenuItem>> {
        let _query_guard = self.pubapps_query_lock.lock().await;
        let (stdout, _) = self
            .execute_default(&format!("which {CMD_GET_APPS} >/dev/null && {CMD_GET_APPS}"))
            .await?;
        Ok(pubapps::split_raw_menu(&stdout))
    }

    /// The `x2gogetapps` output exactly as the server script emitted it.
    pub async fn get_published_applications_very_raw(&self) -> Result<String> {
        let _query_guard = self.pubapps_query_lock.lock().await;
        let (stdout, _) = self
            .execute_default(&format!("which {CMD_GET_APPS} >/dev/null && {CMD_GET_APPS}"))
            .await?;
        Ok(stdout)
    }

    /// Ping the server over the exec channel.
    ///
    /// A failing ping marks the session dead and disconnects.
    pub async fn is_alive(&self) -> bool {
        match self.execute_default("echo").await {
            Ok(_) => true,
            Err(_) => {
                if let Ok(transport) = self.transport() {
                    transport.mark_dead();
                }
                self.disconnect().await;
                false
            }
        }
    }

    /// True once the transport has been marked dead.
    pub fn has_session_died(&self) -> bool {
        self.transport
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |t| t.is_dead())
    }

    /// Disconnect from the server and drop all cached discovery state.
    pub async fn disconnect(&self) {
        let transport = self.transport.lock().unwrap().take();
        if let Some(transport) = transport {
            transport.mark_dead();
        }
        *self.remote_home.lock().await = None;
        *self.server_features.lock().await = None;
        *self.server_versions.lock().await = None;
    }
}

/// Build the ordered authentication ladder for one connect attempt.
pub(crate) fn build_auth_rungs(options: &ConnectOptions) -> Result<Vec<AuthRung>> {
    let password = options.credentials.password.clone().unwrap_or_default();

    if options.force_password_auth && !password.is_empty() {
        return Ok(vec![AuthRung::Password(password)]);
    }

    let mut rungs = Vec::new();

    if let Some(key_file) = &options.key_filename {
        let key_file = expand_user(key_file);
        if key_file.exists() {
            rungs.push(AuthRung::Key(Arc::new(load_key(
                &key_file,
                options.credentials.passphrase.as_deref().or({
                    // the password doubles as key passphrase when no
                    // explicit passphrase was supplied
                    if password.is_empty() {
                        None
                    } else {
                        Some(password.as_str())
                    }
                }),
            )?)));
        }
    } else if options.look_for_keys || options.allow_agent {
        for candidate in discover_key_files() {
            match load_key(&candidate, options.credentials.passphrase.as_deref()) {
                Ok(key) => rungs.push(AuthRung::Key(Arc::new(key))),
                Err(Error::PasswordRequired) => {
                    debug!(path = %candidate.display(), "skipping encrypted key without passphrase");
                }
                Err(err) => {
                    debug!(path = %candidate.display(), %err, "failed to load discovered key");
                }
            }
        }
    }

    if !password.is_empty() {
        rungs.push(AuthRung::Password(password));
    } else if rungs.is_empty() {
        // a random throwaway password still triggers host key validation
        // before the auth step fails
        let throwaway: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        rungs.push(AuthRung::Password(throwaway));
    }

    Ok(rungs)
}

fn load_key(path: &std::path::Path, passphrase: Option<&str>) -> Result<russh_keys::key::KeyPair> {
    match russh_keys::load_secret_key(path, passphrase) {
        Ok(key) => Ok(key),
        Err(russh_keys::Error::KeyIsEncrypted) => Err(Error::PasswordRequired),
        Err(err) => {
            if passphrase.is_some() {
                // wrong passphrase: the key cannot be unlocked
                Err(Error::AuthenticationFailed)
            } else {
                Err(Error::Protocol {
                    message: format!("unusable private key {}: {err}", path.display()),
                })
            }
        }
    }
}

fn expand_user(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_owned()
}

fn discover_key_files() -> Vec<PathBuf> {
    let Some(home) = std::env::var_os("HOME") else {
        return Vec::new();
    };
    let ssh_dir = PathBuf::from(home).join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|p| p.exists())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::hooks::DefaultHooks;
    use crate::transport::testing::MockTransport;

    const LISTING_LINE: &str = "24772|ada-50-1423563810_stDgnome-session_dp24|50|ada|S|2015-02-10T11:03:30|c3a9|unused|30001|30002|2015-02-10T11:05:31|1000|unused|30003";

    fn control_with(transport: Arc<MockTransport>) -> ControlSession {
        let control = ControlSession::new("testprofile", Arc::new(DefaultHooks));
        control.attach_transport(transport);
        control
    }

    fn fast_policy(attempts: u32) -> ListingRetryPolicy {
        ListingRetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn feature_cache_avoids_repeat_queries() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("x2gofeaturelist", "X2GO_B\nX2GO_A\n");
        let control = control_with(Arc::clone(&transport));

        let features = control.query_server_features(false).await.unwrap();
        assert_eq!(features, vec!["X2GO_A", "X2GO_B"]);
        control.query_server_features(false).await.unwrap();
        assert_eq!(transport.exec_count("x2gofeaturelist"), 1);

        control.query_server_features(true).await.unwrap();
        assert_eq!(transport.exec_count("x2gofeaturelist"), 2);
    }

    #[tokio::test]
    async fn version_query_parses_component_map() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("x2goversion", "x2goserver: 4.1.0.3\nx2goagent: 3.5.99\n");
        let control = control_with(transport);

        let versions = control.query_server_versions(false).await.unwrap();
        assert_eq!(versions["x2goserver"], "4.1.0.3");
        assert_eq!(versions["x2goagent"], "3.5.99");
    }

    #[tokio::test]
    async fn list_sessions_parses_listing() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("x2golistsessions", LISTING_LINE);
        let control = control_with(transport);

        let sessions = control.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions.contains_key("ada-50-1423563810_stDgnome-session_dp24"));
    }

    #[tokio::test]
    async fn list_sessions_includes_shadow_listing_when_advertised() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("x2gofeaturelist", "X2GO_LIST_SHADOWSESSIONS\n");
        transport.respond("x2golistsessions", LISTING_LINE);
        let control = control_with(Arc::clone(&transport));

        control.list_sessions().await.unwrap();
        assert!(transport
            .executed()
            .iter()
            .any(|c| c.contains("x2golistshadowsessions")));
    }

    #[tokio::test]
    async fn corrupt_listing_recovers_within_retry_budget() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("x2golistsessions", "garbage|partial");
        transport.respond("x2golistsessions", "more|garbage");
        transport.respond("x2golistsessions", LISTING_LINE);
        let control = control_with(Arc::clone(&transport)).with_retry_policy(fast_policy(20));

        let sessions = control.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(transport.exec_count("x2golistsessions"), 3);
    }

    #[tokio::test]
    async fn persistently_corrupt_listing_kills_control_session() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("x2golistsessions", "garbage|forever");
        let control = control_with(Arc::clone(&transport)).with_retry_policy(fast_policy(20));

        let err = control.list_sessions().await.unwrap_err();
        assert!(matches!(err, Error::ListingCorrupted { attempts: 20 }));
        assert_eq!(transport.exec_count("x2golistsessions"), 20);
        assert!(!control.is_connected());
    }

    #[tokio::test]
    async fn suspend_and_terminate_issue_server_commands() {
        let transport = Arc::new(MockTransport::new());
        let control = control_with(Arc::clone(&transport));

        assert!(control.suspend("some-session").await.unwrap());
        assert!(control.terminate("some-session").await.unwrap());
        assert!(transport
            .executed()
            .iter()
            .any(|c| c.contains("x2gosuspend-session some-session")));
        assert!(transport
            .executed()
            .iter()
            .any(|c| c.contains("x2goterminate-session some-session")));
    }

    #[tokio::test]
    async fn clean_sessions_skips_pubapp_providers() {
        let transport = Arc::new(MockTransport::new());
        let pubapp_line = LISTING_LINE.replace("_stDgnome-session_", "_stRPUBLISHED_");
        transport.respond(
            "x2golistsessions",
            &format!("{LISTING_LINE}\n{pubapp_line}"),
        );
        let control = control_with(Arc::clone(&transport));

        control.clean_sessions(false).await.unwrap();
        assert_eq!(transport.exec_count("x2goterminate-session"), 1);
    }

    #[tokio::test]
    async fn remote_home_is_cached() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("echo $HOME", "/home/alice\n");
        let control = control_with(Arc::clone(&transport));

        assert_eq!(control.remote_home().await.unwrap(), "/home/alice");
        control.remote_home().await.unwrap();
        assert_eq!(transport.exec_count("echo $HOME"), 1);
    }

    #[tokio::test]
    async fn home_exists_checks_stat_output() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("echo $HOME", "/home/alice\n");
        transport.respond("stat -tL", "/home/alice 4096 8\n");
        let control = control_with(transport);
        assert!(control.home_exists().await.unwrap());

        let transport = Arc::new(MockTransport::new());
        transport.respond("echo $HOME", "/home/ghost\n");
        transport.respond("stat -tL", "");
        let control = control_with(transport);
        assert!(!control.home_exists().await.unwrap());
    }

    #[tokio::test]
    async fn is_alive_disconnects_on_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.fail("echo");
        let control = control_with(transport);

        assert!(!control.is_alive().await);
        assert!(!control.is_connected());
        assert!(control.has_session_died());
    }

    #[tokio::test]
    async fn published_applications_cached_per_locale() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("x2gofeaturelist", "X2GO_PUBLISHED_APPLICATIONS\n");
        transport.respond(
            "x2gogetapps",
            "<desktop>\nName=App\nExec=app\n</desktop>\n",
        );
        let control = control_with(Arc::clone(&transport));

        let menu = control.get_published_applications("en_US", false, 0).await.unwrap();
        assert_eq!(menu.len(), 1);
        control.get_published_applications("en_US", false, 0).await.unwrap();
        assert_eq!(transport.exec_count("x2gogetapps"), 1);

        // refresh busts the cache
        control.get_published_applications("en_US", true, 0).await.unwrap();
        assert_eq!(transport.exec_count("x2gogetapps"), 2);
    }

    #[tokio::test]
    async fn published_applications_empty_without_feature() {
        let transport = Arc::new(MockTransport::new());
        transport.respond("x2gofeaturelist", "X2GO_SOMETHING_ELSE\n");
        let control = control_with(Arc::clone(&transport));

        let menu = control.get_published_applications("en_US", false, 0).await.unwrap();
        assert!(menu.is_empty());
        assert_eq!(transport.exec_count("x2gogetapps"), 0);
    }

    #[test]
    fn password_only_auth_gets_throwaway_password() {
        // no key, no agent, empty password: a random password is generated
        // so host-key validation still runs before auth fails
        let options = ConnectOptions {
            username: "alice".into(),
            ..Default::default()
        };
        let rungs = build_auth_rungs(&options).unwrap();
        assert_eq!(rungs.len(), 1);
        match &rungs[0] {
            AuthRung::Password(pw) => assert_eq!(pw.len(), 20),
            _ => panic!("expected password rung"),
        }
    }

    #[test]
    fn force_password_auth_skips_keys() {
        let options = ConnectOptions {
            username: "alice".into(),
            credentials: Credentials {
                password: Some("secret".into()),
                passphrase: None,
            },
            key_filename: Some(PathBuf::from("/nonexistent/id_ed25519")),
            force_password_auth: true,
            ..Default::default()
        };
        let rungs = build_auth_rungs(&options).unwrap();
        assert_eq!(rungs.len(), 1);
        assert!(matches!(&rungs[0], AuthRung::Password(pw) if pw == "secret"));
    }

    #[test]
    fn missing_key_file_falls_back_to_password() {
        let options = ConnectOptions {
            username: "alice".into(),
            credentials: Credentials {
                password: Some("secret".into()),
                passphrase: None,
            },
            key_filename: Some(PathBuf::from("/nonexistent/id_ed25519")),
            ..Default::default()
        };
        let rungs = build_auth_rungs(&options).unwrap();
        assert_eq!(rungs.len(), 1);
        assert!(matches!(&rungs[0], AuthRung::Password(pw) if pw == "secret"));
    }
}
