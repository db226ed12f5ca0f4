//! The session facade: stable identity plus the policy layer combining
//! one control session and at most one terminal session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use x2go_core::constants::{self, PUBLISHED_CMD, SHADOW_TOKEN};
use x2go_core::error::{Error, Result};
use x2go_core::listing::SessionInfo;
use x2go_core::params::{SessionParams, SessionType};
use x2go_core::status::SessionStatus;

use crate::config::{ConnectOptions, GraphicsProxyLauncher, ProfileStore, SshProxy};
use crate::control::ControlSession;
use crate::hooks::SessionHooks;
use crate::terminal::{FolderKind, TerminalOptions, TerminalSession};
use crate::transport::CommandTransport;

/// Feature toggles resolved per session from the profile.
#[derive(Debug, Clone)]
pub struct SessionFeatures {
    pub sound: bool,
    pub printing: bool,
    pub mimebox: bool,
    pub folder_sharing: bool,
    /// MIME box extension whitelist.
    pub mimebox_extensions: Vec<String>,
}

impl Default for SessionFeatures {
    fn default() -> Self {
        SessionFeatures {
            sound: true,
            printing: false,
            mimebox: false,
            folder_sharing: false,
            mimebox_extensions: Vec::new(),
        }
    }
}

struct Inner {
    server: String,
    port: u16,
    session_name: Option<String>,
    status: SessionStatus,
    /// Status as of the previous reconciliation pass. Local lifecycle
    /// marks do not touch this, so the registry diff still sees the
    /// transition on the next pass.
    last_status: SessionStatus,
    /// Status as written by the latest reconciliation pass.
    observed: SessionStatus,
    last_update: Option<Instant>,
    /// Session has been handed out for use (blocks virgin reuse).
    activated: bool,
    /// This session currently controls folder sharing for its profile.
    master: bool,
    /// A terminal session exists or is being constructed right now.
    terminal_pending: bool,
    progress: i8,
    share_local_folders: Vec<String>,
    features: SessionFeatures,
    published_applications: bool,
    connect_options: ConnectOptions,
    params: SessionParams,
}

/// One x2go session with a process-lifetime UUID identity.
///
/// The server-side session name may change over the session's life (or be
/// absent entirely); the UUID never does. A per-session mutex serializes
/// start/resume/suspend/terminate against each other without blocking
/// status reads.
pub struct Session {
    uuid: Uuid,
    profile_id: String,
    profile_name: std::sync::Mutex<String>,
    control: Arc<ControlSession>,
    hooks: Arc<dyn SessionHooks>,
    proxy_launcher: Arc<dyn GraphicsProxyLauncher>,
    profile_store: Option<Arc<dyn ProfileStore>>,
    terminal_opts: TerminalOptions,
    keep_controlsession_alive: bool,

    inner: std::sync::Mutex<Inner>,
    terminal: AsyncMutex<Option<TerminalSession>>,
    /// Serializes lifecycle operations.
    op_lock: AsyncMutex<()>,
}

/// Constructor arguments for [`Session`].
pub struct SessionBuilder {
    pub server: String,
    pub port: u16,
    pub profile_id: String,
    pub profile_name: String,
    pub session_name: Option<String>,
    pub control: Option<Arc<ControlSession>>,
    pub hooks: Arc<dyn SessionHooks>,
    pub proxy_launcher: Arc<dyn GraphicsProxyLauncher>,
    pub profile_store: Option<Arc<dyn ProfileStore>>,
    pub params: SessionParams,
    pub features: SessionFeatures,
    pub connect_options: ConnectOptions,
    pub terminal_opts: TerminalOptions,
    pub keep_controlsession_alive: bool,
}

impl Session {
    pub fn new(builder: SessionBuilder) -> Arc<Self> {
        let control = builder
            .control
            .unwrap_or_else(|| Arc::new(ControlSession::new(&builder.profile_name, Arc::clone(&builder.hooks))));

        let published = builder.params.published_applications
            || builder
                .session_name
                .as_deref()
                .is_some_and(|n| n.contains(constants::PUBLISHED_MARKER));

        let mut params = builder.params;
        if published && params.cmd.is_empty() {
            params.cmd = PUBLISHED_CMD.to_owned();
        }

        Arc::new(Session {
            uuid: Uuid::new_v4(),
            profile_id: builder.profile_id,
            profile_name: std::sync::Mutex::new(builder.profile_name),
            control,
            hooks: builder.hooks,
            proxy_launcher: builder.proxy_launcher,
            profile_store: builder.profile_store,
            terminal_opts: builder.terminal_opts,
            keep_controlsession_alive: builder.keep_controlsession_alive,
            inner: std::sync::Mutex::new(Inner {
                status: SessionStatus::virgin(&builder.server),
                last_status: SessionStatus::virgin(&builder.server),
                observed: SessionStatus::virgin(&builder.server),
                server: builder.server,
                port: builder.port,
                session_name: builder.session_name,
                last_update: None,
                activated: false,
                master: false,
                terminal_pending: false,
                progress: 0,
                share_local_folders: Vec::new(),
                features: builder.features,
                published_applications: published,
                connect_options: builder.connect_options,
                params,
            }),
            terminal: AsyncMutex::new(None),
            op_lock: AsyncMutex::new(()),
        })
    }

    // =========================================================================
    // Identity and bookkeeping accessors
    // =========================================================================

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn profile_name(&self) -> String {
        self.profile_name.lock().unwrap().clone()
    }

    pub fn set_profile_name(&self, profile_name: &str) {
        *self.profile_name.lock().unwrap() = profile_name.to_owned();
        self.control.set_profile_name(profile_name);
    }

    pub fn server(&self) -> String {
        self.inner.lock().unwrap().server.clone()
    }

    pub fn set_server(&self, server: &str) {
        self.inner.lock().unwrap().server = server.to_owned();
    }

    pub fn session_name(&self) -> Option<String> {
        self.inner.lock().unwrap().session_name.clone()
    }

    pub fn set_session_name(&self, session_name: Option<String>) {
        self.inner.lock().unwrap().session_name = session_name;
    }

    pub fn control_session(&self) -> Arc<ControlSession> {
        Arc::clone(&self.control)
    }

    pub fn is_activated(&self) -> bool {
        self.inner.lock().unwrap().activated
    }

    pub fn set_activated(&self, activated: bool) {
        self.inner.lock().unwrap().activated = activated;
    }

    pub fn is_virgin(&self) -> bool {
        self.inner.lock().unwrap().status.virgin
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().status.connected
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().status.running.unwrap_or(false)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().unwrap().status.suspended.unwrap_or(false)
    }

    pub fn has_terminated(&self) -> bool {
        self.inner.lock().unwrap().status.terminated.unwrap_or(false)
    }

    pub fn is_faulty(&self) -> bool {
        self.inner.lock().unwrap().status.faulty.unwrap_or(false)
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().unwrap().status.clone()
    }

    pub fn last_status(&self) -> SessionStatus {
        self.inner.lock().unwrap().last_status.clone()
    }

    /// Replace the desired parameters (on profile changes).
    pub fn update_params(&self, params: SessionParams) {
        self.inner.lock().unwrap().params = params;
    }

    /// Replace the credential material for the next connect.
    pub fn set_connect_options(&self, options: ConnectOptions) {
        self.inner.lock().unwrap().connect_options = options;
    }

    /// A lifecycle operation is currently running on this session.
    pub fn is_busy(&self) -> bool {
        self.op_lock.try_lock().is_err()
    }

    /// The desired session parameters (for backend cloning).
    pub fn params(&self) -> SessionParams {
        self.inner.lock().unwrap().params.clone()
    }

    /// The resolved feature toggles (for backend cloning).
    pub fn features(&self) -> SessionFeatures {
        self.inner.lock().unwrap().features.clone()
    }

    /// Whether the shared control session outlives this session.
    pub fn keeps_control_session_alive(&self) -> bool {
        self.keep_controlsession_alive
    }

    /// Mark a server-discovered session: connected, in use, not virgin.
    ///
    /// Seeding all three snapshots keeps the first reconciliation pass
    /// from reporting the discovery as a started-by-other transition.
    pub fn mark_discovered(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.activated = true;
        inner.status.connected = true;
        inner.status.virgin = false;
        inner.observed = inner.status.clone();
        inner.last_status = inner.status.clone();
    }

    /// Session startup/resumption progress: monotonic 0-100, -1 on
    /// failure.
    pub fn progress(&self) -> i8 {
        self.inner.lock().unwrap().progress
    }

    fn set_progress(&self, value: i8) {
        self.inner.lock().unwrap().progress = value;
    }

    /// True while this session holds (or is constructing) a terminal.
    pub fn has_terminal_session(&self) -> bool {
        self.inner.lock().unwrap().terminal_pending
    }

    /// True if this session provides the published-applications menu.
    pub async fn is_published_applications_provider(&self) -> bool {
        let terminal = self.terminal.lock().await;
        terminal
            .as_ref()
            .is_some_and(|t| t.is_published_applications_provider())
    }

    /// Whether this session is configured for published-applications mode.
    pub fn is_published_applications_session(&self) -> bool {
        self.inner.lock().unwrap().published_applications
    }

    pub async fn is_desktop_session(&self) -> bool {
        let terminal = self.terminal.lock().await;
        terminal.as_ref().is_some_and(|t| t.is_desktop_session())
    }

    // =========================================================================
    // Connecting
    // =========================================================================

    /// Connect the control session, if not already connected.
    ///
    /// Credential material held in the options is zeroed right after the
    /// attempt, successful or not.
    pub async fn connect(&self, proxy: Option<Arc<dyn SshProxy>>) -> Result<bool> {
        if self.control.is_connected() {
            debug!(profile = %self.profile_name(), "control session already connected");
            self.inner.lock().unwrap().status.connected = true;
            return Ok(true);
        }

        let (server, port, options) = {
            let mut inner = self.inner.lock().unwrap();
            let options = inner.connect_options.clone();
            inner.connect_options.scrub_credentials();
            (inner.server.clone(), inner.port, options)
        };

        let connected = match self.control.connect(&server, port, options, proxy).await {
            Ok(connected) => connected,
            Err(Error::RemoteHomeMissing) => {
                self.disconnect().await;
                return Err(Error::RemoteHomeMissing);
            }
            Err(err) => return Err(err),
        };

        self.inner.lock().unwrap().status.connected = connected;
        if connected {
            let _ = self.update_status(None, true).await;
        }
        Ok(connected)
    }

    /// Disconnect and reset all observations.
    pub async fn disconnect(&self) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.status.reset_disconnected();
        }
        self.demote_from_master().await;
        if !self.keep_controlsession_alive {
            self.control.disconnect().await;
        }
        true
    }

    /// Ping the control session; a failure disconnects and fires the
    /// death hook.
    pub async fn is_alive(&self) -> bool {
        if self.control.is_alive().await {
            return true;
        }
        self.hooks.on_control_session_death(&self.profile_name());
        self.disconnect().await;
        false
    }

    /// Fetch the server feature list through the control session.
    pub async fn server_features(&self) -> Result<Vec<String>> {
        self.control.query_server_features(false).await
    }

    // =========================================================================
    // Status reconciliation
    // =========================================================================

    /// Reconcile the local status tuple against a server session list.
    ///
    /// Throttled to one update per second unless `force` is set. Returns
    /// `false` when the update was skipped.
    pub async fn update_status(
        &self,
        session_list: Option<&HashMap<String, SessionInfo>>,
        force: bool,
    ) -> Result<bool> {
        {
            let inner = self.inner.lock().unwrap();
            if !force {
                if let Some(last) = inner.last_update {
                    if last.elapsed() < constants::STATUS_UPDATE_THROTTLE {
                        return Ok(false);
                    }
                }
            }
        }

        let fetched;
        let list = match session_list {
            Some(list) => list,
            None => match self.control.list_sessions().await {
                Ok(list) => {
                    fetched = list;
                    &fetched
                }
                Err(err) => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.last_status = inner.observed.clone();
                    inner.status.reset_disconnected();
                    inner.observed = inner.status.clone();
                    inner.last_update = Some(Instant::now());
                    return Err(err);
                }
            },
        };

        let observed = {
            let inner = self.inner.lock().unwrap();
            inner
                .session_name
                .as_ref()
                .and_then(|name| list.get(name))
                .map(|info| info.status)
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.last_status = inner.observed.clone();
            inner.status.connected = true;
            inner.status.apply_observation(observed);
            inner.observed = inner.status.clone();
            inner.last_update = Some(Instant::now());
        }

        // refresh the terminal's copy of the server-side record
        if let Some(name) = self.session_name() {
            if let Some(fresh) = list.get(&name) {
                let mut terminal = self.terminal.lock().await;
                if let Some(terminal) = terminal.as_mut() {
                    terminal.update_session_info(fresh);
                }
            }
        }

        Ok(true)
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Start a new session.
    pub async fn start(&self) -> Result<bool> {
        self.set_session_name(None);
        self.resume_internal(None, None).await
    }

    /// Resume a session by name (or the session's current name).
    pub async fn resume(
        &self,
        session_name: Option<&str>,
        session_list: Option<&HashMap<String, SessionInfo>>,
    ) -> Result<bool> {
        self.resume_internal(session_name, session_list).await
    }

    async fn resume_internal(
        &self,
        session_name: Option<&str>,
        session_list: Option<&HashMap<String, SessionInfo>>,
    ) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        self.set_progress(1);
        self.inner.lock().unwrap().terminal_pending = true;

        let result = self.resume_locked(session_name, session_list).await;
        match &result {
            Ok(true) => {}
            _ => {
                self.inner.lock().unwrap().terminal_pending = false;
                self.set_progress(-1);
            }
        }
        result
    }

    async fn resume_locked(
        &self,
        session_name: Option<&str>,
        session_list: Option<&HashMap<String, SessionInfo>>,
    ) -> Result<bool> {
        if let Some(name) = session_name {
            if self.session_name().is_none() {
                self.set_session_name(Some(name.to_owned()));
            }
        }
        let is_new_session = self.session_name().is_none();

        self.set_progress(2);
        if !self.is_alive().await {
            return Ok(false);
        }
        self.set_progress(5);

        if self.control.test_sftp().await.is_err() {
            self.hooks.on_sftp_unavailable(&self.profile_name());
            return Ok(false);
        }
        self.set_progress(7);

        // another client may still hold the session; suspend it first and
        // give that client's SSH stack time to release its forwarded
        // channels (SSH offers no way to observe the release)
        if !is_new_session && self.is_running() {
            if let Some(name) = self.session_name() {
                let _ = self.control.suspend(&name).await;
                self.set_progress(10);
                tokio::time::sleep(constants::TAKEOVER_GRACE).await;
                self.set_progress(15);
            }
        }
        self.set_progress(20);

        // construct the terminal session
        let seed_info = if let Some(name) = self.session_name() {
            match session_list {
                Some(list) => list.get(&name).cloned(),
                None => self.control.list_sessions().await?.get(&name).cloned(),
            }
        } else {
            None
        };

        let (params, features) = {
            let inner = self.inner.lock().unwrap();
            (inner.params.clone(), inner.features.clone())
        };
        let transport = self.transport()?;
        let mut terminal = TerminalSession::new(
            Arc::clone(&self.control),
            transport,
            Arc::clone(&self.hooks),
            Arc::clone(&self.proxy_launcher),
            &self.profile_name(),
            seed_info,
            TerminalOptions {
                params,
                ..clone_terminal_opts(&self.terminal_opts)
            },
        );

        let started = if is_new_session {
            terminal.start().await
        } else {
            terminal.resume().await
        };
        self.set_progress(25);

        match started {
            Ok(true) => {}
            Ok(false) => {
                self.hooks.on_startup_failed(&self.profile_name());
                return Ok(false);
            }
            Err(Error::SharingDenied) => {
                self.hooks.on_sharing_denied(&self.profile_name());
                return Err(Error::SharingDenied);
            }
            Err(err) if err.is_transport_fatal() => {
                self.hooks.on_control_session_death(&self.profile_name());
                self.disconnect().await;
                return Err(err);
            }
            Err(err) => {
                self.hooks.on_startup_failed(&self.profile_name());
                return Err(err);
            }
        }

        let name = terminal.session_name().ok_or(Error::StartupFailed {
            message: "terminal session has no name after startup".into(),
        })?;
        self.set_session_name(Some(name.clone()));
        terminal.protect_session_info();
        self.set_progress(30);

        if self.is_published_applications_session() && terminal.params().cmd != PUBLISHED_CMD {
            self.inner.lock().unwrap().published_applications = false;
        }
        self.set_progress(35);

        // resource features degrade individually, never abort the startup
        let mut env = HashMap::new();
        if features.sound && terminal.params().sound_system != "none" {
            if let Err(err) = terminal.start_sound().await {
                if err.is_transport_fatal() {
                    return self.fail_transport(err).await;
                }
                self.hooks.on_sound_not_available(&self.profile_name(), &name);
            }
        }
        self.set_progress(50);

        let wants_sshfs = features.printing || features.mimebox || features.folder_sharing;
        let mut sshfs_ok = false;
        if wants_sshfs {
            match terminal.start_sshfs().await {
                Ok(()) => sshfs_ok = true,
                Err(err) if err.is_transport_fatal() => return self.fail_transport(err).await,
                Err(_) => {
                    self.hooks.on_sshfs_not_available(&self.profile_name(), &name);
                }
            }
        }
        self.set_progress(60);

        if sshfs_ok && features.printing {
            match terminal.start_printing().await {
                Ok(()) => {
                    if let Some(spool) = terminal.printing_spooldir() {
                        env.insert("X2GO_SPOOLDIR".to_owned(), spool);
                    }
                }
                Err(err) if err.is_transport_fatal() => return self.fail_transport(err).await,
                Err(_) => self.hooks.on_printing_not_available(&self.profile_name(), &name),
            }
        }
        self.set_progress(70);

        if sshfs_ok && features.mimebox {
            match terminal.start_mimebox(&features.mimebox_extensions).await {
                Ok(()) => {
                    if let Some(spool) = terminal.mimebox_spooldir() {
                        env.insert("X2GO_MIMEBOX".to_owned(), spool);
                    }
                }
                Err(err) if err.is_transport_fatal() => return self.fail_transport(err).await,
                Err(_) => self.hooks.on_mimebox_not_available(&self.profile_name(), &name),
            }
        }
        self.set_progress(80);

        // only a brand-new session execs the user command
        if is_new_session {
            match terminal.run_command(None, &env).await {
                Ok(_) => {}
                Err(Error::NoSuchCommand { .. }) => {}
                Err(err) if err.is_transport_fatal() => return self.fail_transport(err).await,
                Err(err) => return Err(err),
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.status.mark_running();
        }
        self.set_progress(90);

        // standalone sessions handle folder sharing themselves; embedded
        // ones wait for master promotion by the registry
        terminal.unprotect_session_info();
        *self.terminal.lock().await = Some(terminal);

        if self.profile_store.is_none() && features.folder_sharing {
            let _ = self.share_all_local_folders().await;
        }
        self.set_progress(100);

        info!(session = %name, profile = %self.profile_name(), "session up");
        Ok(true)
    }

    async fn fail_transport(&self, err: Error) -> Result<bool> {
        self.hooks.on_control_session_death(&self.profile_name());
        self.disconnect().await;
        Err(err)
    }

    fn transport(&self) -> Result<Arc<dyn CommandTransport>> {
        // the control session owns the transport; terminals borrow it for
        // their reverse tunnels
        self.control
            .transport_handle()
            .ok_or(Error::SessionDead)
    }

    /// Share another user's running desktop.
    ///
    /// `desktop` has the form `<user>@<display>`; `mode` 0 is view-only,
    /// 1 is full access.
    pub async fn share_desktop(&self, desktop: &str, mode: u8) -> Result<bool> {
        let (user, display) = desktop.split_once('@').ok_or_else(|| Error::Protocol {
            message: format!("desktop id {desktop:?} is not of the form user@display"),
        })?;
        if user.is_empty() || display.is_empty() {
            return Err(Error::Protocol {
                message: "need user name and display number of the shared desktop".into(),
            });
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.params.cmd = format!("{mode}{SHADOW_TOKEN}{user}{SHADOW_TOKEN}{display}");
            inner.params.session_type = Some(SessionType::Shared);
        }

        if self.control.remote_username()? != user {
            info!(
                owner = user,
                "waiting for the desktop owner to interactively grant access, this may take a while"
            );
        }

        self.set_session_name(None);
        match self.resume_internal(None, None).await {
            Err(Error::SharingDenied) => Ok(false),
            other => other,
        }
    }

    /// Suspend this session.
    pub async fn suspend(&self) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        self.suspend_locked().await
    }

    async fn suspend_locked(&self) -> Result<bool> {
        if !self.is_alive().await {
            return Ok(false);
        }

        let mut terminal_guard = self.terminal.lock().await;
        if let Some(terminal) = terminal_guard.as_mut() {
            // local resources go down before the server command
            let _ = terminal.unshare_all_local_folders().await;
            drop(terminal_guard);
            self.demote_from_master().await;

            let mut terminal_guard = self.terminal.lock().await;
            if let Some(mut terminal) = terminal_guard.take() {
                terminal.suspend().await?;
            }
            let mut inner = self.inner.lock().unwrap();
            inner.status.mark_suspended();
            inner.terminal_pending = false;
            return Ok(true);
        }
        drop(terminal_guard);

        if let Some(name) = self.session_name() {
            self.control.suspend(&name).await?;
            let mut inner = self.inner.lock().unwrap();
            inner.status.mark_suspended();
            return Ok(true);
        }

        Err(Error::InvalidState {
            expected: "a terminal session or a session name".into(),
            actual: "neither".into(),
        })
    }

    /// Terminate this session.
    pub async fn terminate(&self) -> Result<bool> {
        let _op = self.op_lock.lock().await;

        if !self.is_alive().await {
            return Ok(false);
        }

        let mut terminal_guard = self.terminal.lock().await;
        if let Some(terminal) = terminal_guard.as_mut() {
            let _ = terminal.unshare_all_local_folders().await;
            drop(terminal_guard);
            self.demote_from_master().await;

            let mut terminal_guard = self.terminal.lock().await;
            if let Some(mut terminal) = terminal_guard.take() {
                terminal.terminate().await?;
            }
            let mut inner = self.inner.lock().unwrap();
            inner.status.mark_terminated();
            inner.terminal_pending = false;
            return Ok(true);
        }
        drop(terminal_guard);

        if let Some(name) = self.session_name() {
            self.control.terminate(&name).await?;
            let mut inner = self.inner.lock().unwrap();
            inner.status.mark_terminated();
            return Ok(true);
        }

        Err(Error::InvalidState {
            expected: "a terminal session or a session name".into(),
            actual: "neither".into(),
        })
    }

    /// Release client-side resources after an externally observed
    /// suspend/terminate.
    pub async fn session_cleanup(&self) {
        let mut terminal_guard = self.terminal.lock().await;
        if let Some(mut terminal) = terminal_guard.take() {
            terminal.release_tunnels().await;
            terminal.release_proxy();
            terminal.post_terminate_cleanup().await;
        }
        self.inner.lock().unwrap().terminal_pending = false;
    }

    // =========================================================================
    // Master session role
    // =========================================================================

    /// True if this session controls folder sharing for its profile.
    ///
    /// A standalone session (no profile store) is always its own master.
    pub fn is_master_session(&self) -> bool {
        if self.profile_store.is_none() {
            return true;
        }
        self.inner.lock().unwrap().master
    }

    /// Promote this session to master after `wait`.
    ///
    /// Re-reads the sharable folder list from the profile store and mounts
    /// it. The wait gives freshly promoted sessions time to finish their
    /// tunnel setup; it is workaround-tuned, not protocol-mandated.
    pub async fn promote_to_master(self: Arc<Self>, wait: Duration) {
        info!(
            session = ?self.session_name(),
            profile = %self.profile_name(),
            "promoting to master session"
        );
        {
            let mut inner = self.inner.lock().unwrap();
            inner.master = true;
        }

        if let Some(store) = &self.profile_store {
            let exports = store.exported_folders(&self.profile_id);
            let folders: Vec<String> = exports
                .into_iter()
                .filter_map(|(folder, enabled)| enabled.then_some(folder))
                .collect();
            self.inner.lock().unwrap().share_local_folders = folders;
        }

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let _ = self.share_all_local_folders().await;
    }

    /// Demote this session from the master role, unmounting everything it
    /// mounted. Completes before a successor may mount.
    pub async fn demote_from_master(&self) {
        let was_master = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::replace(&mut inner.master, false)
        };
        if was_master {
            let _ = self.unshare_all_local_folders().await;
        }
    }

    /// Mount every configured sharable folder.
    pub async fn share_all_local_folders(&self) -> Result<bool> {
        let folders = self.inner.lock().unwrap().share_local_folders.clone();
        let mut terminal = self.terminal.lock().await;
        let Some(terminal) = terminal.as_mut() else {
            return Ok(false);
        };
        let mut all_ok = true;
        for folder in folders {
            match terminal.share_local_folder(&folder, FolderKind::Disk).await {
                Ok(true) => {}
                Ok(false) => all_ok = false,
                Err(err) => {
                    warn!(folder = %folder, %err, "sharing local folder failed");
                    all_ok = false;
                }
            }
        }
        Ok(all_ok)
    }

    /// Unmount all folders shared through this session.
    pub async fn unshare_all_local_folders(&self) -> Result<bool> {
        let mut terminal = self.terminal.lock().await;
        match terminal.as_mut() {
            Some(terminal) => terminal.unshare_all_local_folders().await,
            None => Ok(false),
        }
    }

    /// Folders currently mounted through this session.
    pub async fn mounted_folders(&self) -> Vec<String> {
        let terminal = self.terminal.lock().await;
        terminal
            .as_ref()
            .map(|t| t.shared_folders().to_vec())
            .unwrap_or_default()
    }

    // =========================================================================
    // Published applications and auto start
    // =========================================================================

    /// The published-applications menu for this session's profile.
    pub async fn published_applications(&self, lang: &str, refresh: bool) -> Result<x2go_core::pubapps::MenuTree> {
        self.control
            .get_published_applications(lang, refresh, constants::PUBAPP_MAX_NO_SUBMENUS)
            .await
    }

    /// Execute a published application inside the provider session.
    pub async fn exec_published_application(&self, exec_name: &str) -> Result<()> {
        let terminal = self.terminal.lock().await;
        match terminal.as_ref() {
            Some(terminal) => terminal.exec_published_application(exec_name, &HashMap::new()).await,
            None => Err(Error::InvalidState {
                expected: "a running terminal session".into(),
                actual: "none".into(),
            }),
        }
    }

    /// Start or resume automatically after connecting.
    ///
    /// Resumes the newest non-published session if one exists, starts a
    /// new session otherwise. Published provider sessions are never auto
    /// resumed.
    pub async fn auto_start_or_resume(&self) -> Result<bool> {
        if let Some(name) = self.session_name() {
            if !name.contains(constants::PUBLISHED_MARKER) {
                return self.resume(None, None).await;
            }
            return Ok(false);
        }

        let mut sessions = self.control.list_sessions().await?;
        sessions.retain(|_, info| !info.is_published_applications_provider());

        if sessions.is_empty() {
            if self.is_published_applications_session() {
                return Ok(false);
            }
            return self.start().await;
        }

        let names = x2go_core::listing::session_names_by_age(&sessions);
        match names.last() {
            Some(newest) => self.resume(Some(newest), None).await,
            None => Ok(false),
        }
    }
}

fn clone_terminal_opts(opts: &TerminalOptions) -> TerminalOptions {
    TerminalOptions {
        params: opts.params.clone(),
        sessions_rootdir: opts.sessions_rootdir.clone(),
        work_area: opts.work_area,
        sshfs_local_port: opts.sshfs_local_port,
        local_username: opts.local_username.clone(),
        keep_session_cache: opts.keep_session_cache,
    }
}

// =============================================================================
// Tests
// =============================================================================
