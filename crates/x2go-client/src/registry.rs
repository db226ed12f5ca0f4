//! Fleet bookkeeping: the session registry.
//!
//! The registry exclusively owns all sessions (keyed by UUID), shares
//! control sessions per profile, reconciles local state against server
//! listings and elects the per-profile master session that controls
//! folder sharing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use x2go_core::constants;
use x2go_core::error::{Error, Result};
use x2go_core::listing::SessionInfo;
use x2go_core::params::SessionParams;
use x2go_core::status::{diff_status, StatusEvent};

use crate::config::{ConnectOptions, GraphicsProxyLauncher, ProfileStore};
use crate::control::ControlSession;
use crate::hooks::SessionHooks;
use crate::session::{Session, SessionBuilder, SessionFeatures};
use crate::terminal::TerminalOptions;

/// How long a freshly promoted master waits before mounting folders.
///
/// These waits paper over SSH channel teardown races on the server; the
/// promotion *order* is a contract, the durations are tunable.
#[derive(Debug, Clone, Copy)]
pub struct PromotionWaits {
    pub desktop: Duration,
    pub other: Duration,
}

impl Default for PromotionWaits {
    fn default() -> Self {
        PromotionWaits {
            desktop: constants::MASTER_PROMOTION_WAIT_DESKTOP,
            other: constants::MASTER_PROMOTION_WAIT_OTHER,
        }
    }
}

/// Inputs for registering one session.
pub struct RegisterRequest {
    pub server: String,
    pub port: u16,
    pub profile_id: String,
    pub profile_name: String,
    pub session_name: Option<String>,
    pub params: SessionParams,
    pub features: SessionFeatures,
    pub connect_options: ConnectOptions,
    pub terminal_opts: TerminalOptions,
    pub keep_controlsession_alive: bool,
}

/// Which sessions an update pass addresses.
pub enum UpdateTarget<'a> {
    Session(Uuid),
    ProfileName(&'a str),
    ProfileId(&'a str),
}

/// Owns all sessions of a client and reconciles them with the server.
pub struct SessionRegistry {
    hooks: Arc<dyn SessionHooks>,
    proxy_launcher: Arc<dyn GraphicsProxyLauncher>,
    profile_store: Option<Arc<dyn ProfileStore>>,
    promotion_waits: PromotionWaits,

    sessions: std::sync::Mutex<HashMap<Uuid, Arc<Session>>>,
    /// profile id -> shared control session (informally reference counted
    /// by the sessions map).
    control_sessions: std::sync::Mutex<HashMap<String, Arc<ControlSession>>>,
    /// profile name -> master session. A relation only; never extends a
    /// session's lifetime.
    master_sessions: std::sync::Mutex<HashMap<String, Uuid>>,
    profile_locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    last_auto_registration: std::sync::Mutex<Option<Instant>>,
    skip_auto_registration: AtomicBool,
}

impl SessionRegistry {
    pub fn new(
        hooks: Arc<dyn SessionHooks>,
        proxy_launcher: Arc<dyn GraphicsProxyLauncher>,
        profile_store: Option<Arc<dyn ProfileStore>>,
    ) -> Self {
        SessionRegistry {
            hooks,
            proxy_launcher,
            profile_store,
            promotion_waits: PromotionWaits::default(),
            sessions: std::sync::Mutex::new(HashMap::new()),
            control_sessions: std::sync::Mutex::new(HashMap::new()),
            master_sessions: std::sync::Mutex::new(HashMap::new()),
            profile_locks: std::sync::Mutex::new(HashMap::new()),
            last_auto_registration: std::sync::Mutex::new(None),
            skip_auto_registration: AtomicBool::new(false),
        }
    }

    /// Override the master-promotion waits (tests use zero).
    pub fn with_promotion_waits(mut self, waits: PromotionWaits) -> Self {
        self.promotion_waits = waits;
        self
    }

    /// Temporarily skip auto-registration of server-discovered sessions
    /// (avoids duplicate registrations during session startups).
    pub fn disable_session_auto_registration(&self) {
        self.skip_auto_registration.store(true, Ordering::SeqCst);
    }

    /// Re-enable auto-registration of server-discovered sessions.
    pub fn enable_session_auto_registration(&self) {
        self.skip_auto_registration.store(false, Ordering::SeqCst);
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a session, reusing an existing one where possible.
    ///
    /// An unused virgin session of the profile is reused first; a session
    /// already registered under the same server-side name second. The
    /// per-profile lock closes the race between server-discovered sessions
    /// and user-initiated starts.
    pub async fn register(&self, request: RegisterRequest) -> Uuid {
        let profile_lock = self.profile_lock(&request.profile_id);
        let _guard = profile_lock.lock().await;

        if request.session_name.is_none() {
            let virgin = self
                .sessions_of_profile(&request.profile_name)
                .into_iter()
                .find(|s| s.is_virgin() && !s.is_activated());
            if let Some(session) = virgin {
                info!(uuid = %session.uuid(), "reusing registered, still-unused virgin session");
                session.set_activated(true);
                session.update_params(request.params);
                session.set_connect_options(request.connect_options);
                session.set_server(&request.server);
                session.set_profile_name(&request.profile_name);
                return session.uuid();
            }
        }

        if let Some(name) = &request.session_name {
            if let Some(session) = self.session_by_name(name, Some(&request.profile_name)) {
                info!(uuid = %session.uuid(), "reusing session registered under this session name");
                session.set_activated(true);
                session.update_params(request.params);
                session.set_server(&request.server);
                return session.uuid();
            }
        }

        let control = self
            .control_sessions
            .lock()
            .unwrap()
            .get(&request.profile_id)
            .cloned();

        let session = Session::new(SessionBuilder {
            server: request.server,
            port: request.port,
            profile_id: request.profile_id.clone(),
            profile_name: request.profile_name.clone(),
            session_name: request.session_name,
            control,
            hooks: Arc::clone(&self.hooks),
            proxy_launcher: Arc::clone(&self.proxy_launcher),
            profile_store: self.profile_store.clone(),
            params: request.params,
            features: request.features,
            connect_options: request.connect_options,
            terminal_opts: request.terminal_opts,
            keep_controlsession_alive: request.keep_controlsession_alive,
        });

        let uuid = session.uuid();
        info!(uuid = %uuid, profile = %request.profile_name, "registering session");
        self.sessions.lock().unwrap().insert(uuid, Arc::clone(&session));
        self.control_sessions
            .lock()
            .unwrap()
            .entry(request.profile_id)
            .or_insert_with(|| session.control_session());

        uuid
    }

    /// Forget a session completely.
    ///
    /// Drops the profile's shared control session once no session uses it.
    pub fn forget(&self, uuid: Uuid) {
        let removed = self.sessions.lock().unwrap().remove(&uuid);
        if let Some(session) = removed {
            debug!(uuid = %uuid, "forgetting session");
            self.master_sessions
                .lock()
                .unwrap()
                .retain(|_, master| *master != uuid);
            let profile_id = session.profile_id().to_owned();
            let keep = session.keeps_control_session_alive();
            let still_used = self
                .sessions
                .lock()
                .unwrap()
                .values()
                .any(|s| s.profile_id() == profile_id);
            if !still_used && !keep {
                self.control_sessions.lock().unwrap().remove(&profile_id);
            }
        }
    }

    /// Discover and register server-side sessions unknown to this client.
    ///
    /// Backend configuration is cloned from an already-connected session
    /// of the profile. Published-applications provider sessions can be
    /// skipped.
    pub async fn register_available_server_sessions(
        &self,
        profile_name: &str,
        session_list: Option<HashMap<String, SessionInfo>>,
        newly_connected: bool,
        skip_pubapp_sessions: bool,
    ) -> Result<()> {
        {
            let mut last = self.last_auto_registration.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < constants::AUTO_REGISTRATION_THROTTLE {
                    debug!("auto-registration interval too short, skipping");
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        let template = self
            .connected_sessions_of_profile(profile_name)
            .into_iter()
            .next()
            .ok_or_else(|| Error::SessionNotFound(profile_name.to_owned()))?;

        let session_list = match session_list {
            Some(list) => list,
            None => template.control_session().list_sessions().await?,
        };

        // the update kicks out sessions whose server changed before new
        // ones get registered
        self.update_status(
            UpdateTarget::ProfileName(profile_name),
            Some(&session_list),
            true,
            newly_connected,
        )
        .await?;

        let known: Vec<String> = self
            .sessions_of_profile(profile_name)
            .iter()
            .filter_map(|s| s.session_name())
            .collect();

        for name in session_list.keys() {
            if known.iter().any(|k| k == name) {
                continue;
            }
            if self.skip_auto_registration.load(Ordering::SeqCst) {
                continue;
            }
            if skip_pubapp_sessions && name.contains(constants::PUBLISHED_MARKER) {
                continue;
            }
            let uuid = self
                .register(RegisterRequest {
                    server: template.server(),
                    port: 22,
                    profile_id: template.profile_id().to_owned(),
                    profile_name: profile_name.to_owned(),
                    session_name: Some(name.clone()),
                    params: template.params(),
                    features: template.features(),
                    connect_options: ConnectOptions::default(),
                    terminal_opts: TerminalOptions::default(),
                    keep_controlsession_alive: template.keeps_control_session_alive(),
                })
                .await;
            if let Some(session) = self.session(uuid) {
                session.mark_discovered();
                session
                    .update_status(Some(&session_list), true)
                    .await
                    .ok();
                self.dispatch_events(&session, newly_connected).await;
            }
        }

        Ok(())
    }

    // =========================================================================
    // Status reconciliation
    // =========================================================================

    /// Update session status for a target and fire lifecycle hooks.
    ///
    /// Throttled per session unless `force`; fires exactly one hook per
    /// observed transition. A server-name change invalidates the session
    /// silently.
    pub async fn update_status(
        &self,
        target: UpdateTarget<'_>,
        session_list: Option<&HashMap<String, SessionInfo>>,
        force: bool,
        newly_connected: bool,
    ) -> Result<()> {
        let targets: Vec<Arc<Session>> = match target {
            UpdateTarget::Session(uuid) => self.session(uuid).into_iter().collect(),
            UpdateTarget::ProfileName(name) => self.sessions_of_profile(name),
            UpdateTarget::ProfileId(id) => self
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.profile_id() == id)
                .cloned()
                .collect(),
        };

        for session in targets {
            if session.is_busy() {
                continue;
            }
            match session.update_status(session_list, force).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    debug!(uuid = %session.uuid(), %err, "status update failed");
                    continue;
                }
            }
            self.dispatch_events(&session, newly_connected).await;
        }

        self.reconcile_masters().await;
        Ok(())
    }

    async fn dispatch_events(&self, session: &Arc<Session>, newly_connected: bool) {
        let last = session.last_status();
        let current = session.status();
        let profile_name = session.profile_name();
        let session_name = session.session_name().unwrap_or_default();

        let event = diff_status(
            &last,
            &current,
            session.has_terminal_session(),
            newly_connected,
            !session_name.is_empty(),
        );
        let Some(event) = event else {
            return;
        };

        match event {
            StatusEvent::ServerChanged => {
                // configuration change: clean up and forget, no hooks
                warn!(uuid = %session.uuid(), "server name changed, invalidating session");
                session.session_cleanup().await;
                self.forget(session.uuid());
            }
            StatusEvent::Suspended => {
                self.drop_master_if(&profile_name, session.uuid()).await;
                session.session_cleanup().await;
                self.hooks.on_session_event(&profile_name, &session_name, event);
            }
            StatusEvent::Terminated => {
                self.drop_master_if(&profile_name, session.uuid()).await;
                self.hooks.on_session_event(&profile_name, &session_name, event);
                session.session_cleanup().await;
                let spare_virgins = self
                    .sessions_of_profile(&profile_name)
                    .iter()
                    .filter(|s| s.is_virgin())
                    .count();
                if spare_virgins > 1 {
                    self.forget(session.uuid());
                }
            }
            StatusEvent::StartedByMe | StatusEvent::ResumedByMe => {
                self.consider_master(session).await;
                self.hooks.on_session_event(&profile_name, &session_name, event);
            }
            _ => {
                self.hooks.on_session_event(&profile_name, &session_name, event);
            }
        }
    }

    // =========================================================================
    // Master session election
    // =========================================================================

    /// Make a started-by-me session master if appropriate.
    ///
    /// The first running session of a profile becomes master; a desktop
    /// or published-applications session takes the role over from a
    /// non-desktop master.
    async fn consider_master(&self, session: &Arc<Session>) {
        let profile_name = session.profile_name();
        let current = {
            let masters = self.master_sessions.lock().unwrap();
            masters.get(&profile_name).copied()
        };

        match current {
            None => {
                self.assign_master(&profile_name, session, Duration::ZERO).await;
            }
            Some(master_uuid) if master_uuid != session.uuid() => {
                let Some(master) = self.session(master_uuid) else {
                    self.assign_master(&profile_name, session, Duration::ZERO).await;
                    return;
                };
                let master_is_desktop = master.is_desktop_session().await;
                let takes_over = !master_is_desktop
                    && (session.is_desktop_session().await
                        || session.is_published_applications_provider().await);
                if takes_over {
                    master.demote_from_master().await;
                    self.assign_master(&profile_name, session, Duration::ZERO).await;
                }
            }
            _ => {}
        }
    }

    /// Ensure every connected profile with running sessions has exactly
    /// one master.
    ///
    /// Promotion order: first running desktop session, else the first
    /// published-applications provider, else any running associated
    /// session.
    async fn reconcile_masters(&self) {
        for profile_name in self.connected_profiles() {
            let has_master = {
                let masters = self.master_sessions.lock().unwrap();
                masters
                    .get(&profile_name)
                    .is_some_and(|uuid| self.sessions.lock().unwrap().contains_key(uuid))
            };
            if has_master {
                continue;
            }

            let running: Vec<Arc<Session>> = self
                .sessions_of_profile(&profile_name)
                .into_iter()
                .filter(|s| s.is_running() && s.has_terminal_session())
                .collect();
            if running.is_empty() {
                continue;
            }

            let mut candidate = None;
            for session in &running {
                if session.is_desktop_session().await {
                    candidate = Some((Arc::clone(session), self.promotion_waits.desktop));
                    break;
                }
            }
            if candidate.is_none() {
                for session in &running {
                    if session.is_published_applications_provider().await {
                        candidate = Some((Arc::clone(session), self.promotion_waits.other));
                        break;
                    }
                }
            }
            if candidate.is_none() {
                candidate = Some((Arc::clone(&running[0]), self.promotion_waits.other));
            }

            if let Some((session, wait)) = candidate {
                self.assign_master(&profile_name, &session, wait).await;
            }
        }
    }

    async fn assign_master(&self, profile_name: &str, session: &Arc<Session>, wait: Duration) {
        {
            let mut masters = self.master_sessions.lock().unwrap();
            masters.insert(profile_name.to_owned(), session.uuid());
        }
        Arc::clone(session).promote_to_master(wait).await;
    }

    async fn drop_master_if(&self, profile_name: &str, uuid: Uuid) {
        let was_master = {
            let mut masters = self.master_sessions.lock().unwrap();
            if masters.get(profile_name) == Some(&uuid) {
                masters.remove(profile_name);
                true
            } else {
                false
            }
        };
        if was_master {
            if let Some(session) = self.session(uuid) {
                session.demote_from_master().await;
            }
        }
    }

    /// The master session of a profile, if one is elected and alive.
    pub fn master_session(&self, profile_name: &str) -> Option<Arc<Session>> {
        let uuid = *self.master_sessions.lock().unwrap().get(profile_name)?;
        let session = self.session(uuid)?;
        if session.is_master_session() {
            Some(session)
        } else {
            self.master_sessions.lock().unwrap().remove(profile_name);
            None
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The session registered under a UUID.
    pub fn session(&self, uuid: Uuid) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&uuid).cloned()
    }

    /// All registered session UUIDs.
    pub fn uuids(&self) -> Vec<Uuid> {
        self.sessions.lock().unwrap().keys().copied().collect()
    }

    /// All sessions of a profile.
    pub fn sessions_of_profile(&self, profile_name: &str) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.profile_name() == profile_name)
            .cloned()
            .collect()
    }

    /// Connected sessions of a profile.
    pub fn connected_sessions_of_profile(&self, profile_name: &str) -> Vec<Arc<Session>> {
        self.sessions_of_profile(profile_name)
            .into_iter()
            .filter(|s| s.is_connected())
            .collect()
    }

    /// Running sessions of a profile.
    pub fn running_sessions_of_profile(&self, profile_name: &str) -> Vec<Arc<Session>> {
        self.sessions_of_profile(profile_name)
            .into_iter()
            .filter(|s| s.is_running())
            .collect()
    }

    /// Profile names with at least one connected session.
    pub fn connected_profiles(&self) -> Vec<String> {
        let mut profiles: Vec<String> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.profile_name())
            .collect();
        profiles.sort();
        profiles.dedup();
        profiles
    }

    /// Find a session by server-side session name.
    pub fn session_by_name(
        &self,
        session_name: &str,
        match_profile: Option<&str>,
    ) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| {
                s.session_name().as_deref() == Some(session_name)
                    && match_profile.map_or(true, |p| s.profile_name() == p)
            })
            .cloned()
    }

    /// True if a session of this server-side name is registered.
    pub fn has_session_of_name(&self, session_name: &str, match_profile: Option<&str>) -> bool {
        self.session_by_name(session_name, match_profile).is_some()
    }

    fn profile_lock(&self, profile_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.profile_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(profile_id.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
