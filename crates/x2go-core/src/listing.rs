//! Server-reported session facts and listing output parsing.
//!
//! The server reports sessions in two plain-text shapes: `x2golistsessions`
//! emits one pipe-delimited line per session, `x2gostartagent` emits one
//! value per line. Both end up in a [`SessionInfo`] record.

use std::collections::HashMap;

use crate::constants::PUBLISHED_MARKER;
use crate::error::{Error, Result};
use crate::params::SessionType;

/// Run state of a server-side terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Session is attached and running (`R`).
    Running,
    /// Session is detached and suspended (`S`).
    Suspended,
}

impl RunState {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "R" => Ok(RunState::Running),
            "S" => Ok(RunState::Suspended),
            other => Err(Error::Protocol {
                message: format!("unknown session status: {other:?}"),
            }),
        }
    }
}

/// Everything the server reports about one terminal session.
///
/// Created when a session starts, resumes or is discovered via listing.
/// The `protected` flag write-protects the record while a resume is in
/// flight, so a concurrent status poll cannot race the port reallocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Server-assigned session name; encodes session type and color depth.
    pub name: String,
    /// X display number allocated on the server.
    pub display: u32,
    /// PID of the server-side agent process.
    pub agent_pid: u32,
    /// Server port of the graphics channel.
    pub graphics_port: u16,
    /// Server port of the sound channel.
    pub sound_port: u16,
    /// Server port of the sshfs channel.
    pub sshfs_port: u16,
    /// Session run state.
    pub status: RunState,
    /// Authentication cookie for the graphics proxy.
    pub cookie: String,
    /// Server host name as reported in the listing.
    pub hostname: String,
    /// Session owner; a user id in listings, rewritten after resume.
    pub username: String,
    /// Creation timestamp, verbatim server format.
    pub date_created: String,
    /// Suspension timestamp, verbatim server format.
    pub date_suspended: String,
    /// Client-side per-session directory (`<rootdir>/S-<name>`).
    pub local_container: String,
    /// Server-side per-session directory (`<home>/.x2go/C-<name>`).
    pub remote_container: String,
    protected: bool,
}

/// Outcome of applying `x2goresume-session` port reallocation output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortReallocation {
    /// Graphics port changed to a fresh server-side allocation.
    pub graphics_changed: bool,
    /// Sound port changed.
    pub sound_changed: bool,
    /// The reported sound port was unparsable; sound must be disabled.
    pub sound_lost: bool,
    /// Sshfs port changed.
    pub sshfs_changed: bool,
    /// The reported sshfs port was unparsable; folder sharing, printing
    /// and the MIME box must be disabled.
    pub sshfs_lost: bool,
}

impl SessionInfo {
    /// Parse one pipe-delimited line of `x2golistsessions` output.
    ///
    /// Field layout (0-based): agent pid | name | display | hostname |
    /// status | created | cookie | _ | graphics port | sound port |
    /// suspended | username | _ | sshfs port.
    pub fn from_listing_line(line: &str) -> Result<Self> {
        let f: Vec<&str> = line.split('|').collect();
        if f.len() < 14 {
            return Err(Error::Protocol {
                message: format!("short listing line ({} fields)", f.len()),
            });
        }
        Ok(SessionInfo {
            agent_pid: parse_field(f[0], "agent pid")?,
            name: f[1].to_owned(),
            display: parse_field(f[2], "display")?,
            hostname: f[3].to_owned(),
            status: RunState::parse(f[4])?,
            date_created: f[5].to_owned(),
            cookie: f[6].to_owned(),
            graphics_port: parse_field(f[8], "graphics port")?,
            sound_port: parse_field(f[9], "sound port")?,
            date_suspended: f[10].to_owned(),
            username: f[11].to_owned(),
            sshfs_port: parse_field(f[13], "sshfs port")?,
            local_container: String::new(),
            remote_container: String::new(),
            protected: false,
        })
    }

    /// Parse line-oriented `x2gostartagent` stdout.
    ///
    /// Line layout: display, cookie, agent pid, session name, graphics
    /// port, sound port, sshfs port. The session is presumed running.
    pub fn from_agent_output(output: &str, username: &str, hostname: &str) -> Result<Self> {
        let l: Vec<&str> = output.lines().collect();
        if l.len() < 7 {
            return Err(Error::Protocol {
                message: format!("short x2gostartagent output ({} lines)", l.len()),
            });
        }
        Ok(SessionInfo {
            display: parse_field(l[0], "display")?,
            cookie: l[1].to_owned(),
            agent_pid: parse_field(l[2], "agent pid")?,
            name: l[3].to_owned(),
            graphics_port: parse_field(l[4], "graphics port")?,
            sound_port: parse_field(l[5], "sound port")?,
            sshfs_port: parse_field(l[6], "sshfs port")?,
            status: RunState::Running,
            username: username.to_owned(),
            hostname: hostname.to_owned(),
            date_created: String::new(),
            date_suspended: String::new(),
            local_container: String::new(),
            remote_container: String::new(),
            protected: false,
        })
    }

    /// Apply server-reported port reallocations from `x2goresume-session`
    /// stdout.
    ///
    /// When the previously allocated ports are already taken by another
    /// connection the server prints `gr_port=`, `sound_port=` and
    /// `fs_port=` fragments. Losing the graphics port is fatal for the
    /// resume; losing sound or sshfs only degrades those features.
    pub fn apply_resume_output(&mut self, output: &str) -> Result<PortReallocation> {
        let mut realloc = PortReallocation::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key {
                k if k.contains("gr_port") => {
                    if value != self.graphics_port.to_string() {
                        self.graphics_port =
                            value.parse().map_err(|_| Error::PortReallocationFailed)?;
                        realloc.graphics_changed = true;
                    }
                }
                k if k.contains("sound_port") => {
                    if value != self.sound_port.to_string() {
                        match value.parse() {
                            Ok(port) => {
                                self.sound_port = port;
                                realloc.sound_changed = true;
                            }
                            Err(_) => realloc.sound_lost = true,
                        }
                    }
                }
                k if k.contains("fs_port") => {
                    if value != self.sshfs_port.to_string() {
                        match value.parse() {
                            Ok(port) => {
                                self.sshfs_port = port;
                                realloc.sshfs_changed = true;
                            }
                            Err(_) => realloc.sshfs_lost = true,
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(realloc)
    }

    /// True while the session is in running state.
    pub fn is_running(&self) -> bool {
        self.status == RunState::Running
    }

    /// True while the session is in suspended state.
    pub fn is_suspended(&self) -> bool {
        self.status == RunState::Suspended
    }

    /// Decode the session type from the session name.
    ///
    /// The second underscore-separated token carries the type character at
    /// offset 2 (e.g. `hostname-51-1423...._stDgnome-session_dp24`). A
    /// rootless provider session with the published marker counts as
    /// published.
    pub fn session_type(&self) -> SessionType {
        let ty = self
            .name
            .split('_')
            .nth(1)
            .and_then(|tok| tok.chars().nth(2));
        match ty {
            Some('D') => SessionType::Desktop,
            Some('S') => SessionType::Shared,
            Some('R') if !self.is_published_applications_provider() => SessionType::Rootless,
            _ => SessionType::Published,
        }
    }

    /// True if this session provides a published-applications menu.
    pub fn is_published_applications_provider(&self) -> bool {
        self.name.contains(PUBLISHED_MARKER)
    }

    /// True if this is a full desktop session.
    pub fn is_desktop_session(&self) -> bool {
        self.session_type() == SessionType::Desktop
    }

    /// Decode the color depth from the session name (`..._dp24` suffix).
    pub fn color_depth_from_name(&self) -> Option<u8> {
        self.name
            .split('_')
            .nth(2)
            .and_then(|tok| tok.get(2..))
            .and_then(|d| d.parse().ok())
    }

    /// Share mode of a shadow session (view-only or full access).
    pub fn share_mode(&self) -> Option<char> {
        if self.session_type() != SessionType::Shared {
            return None;
        }
        self.name.split('_').nth(1).and_then(|tok| tok.chars().nth(3))
    }

    /// Write-protect this record against concurrent listing updates.
    pub fn protect(&mut self) {
        self.protected = true;
    }

    /// Allow listing updates again.
    pub fn unprotect(&mut self) {
        self.protected = false;
    }

    /// True while the record is write-protected.
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Merge server-volatile fields from a freshly listed record.
    ///
    /// No-op while this record is protected.
    pub fn update_from(&mut self, other: &SessionInfo) {
        if self.protected {
            return;
        }
        self.graphics_port = other.graphics_port;
        self.sound_port = other.sound_port;
        self.sshfs_port = other.sshfs_port;
        self.date_suspended = other.date_suspended.clone();
        self.status = other.status;
    }
}

fn parse_field<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| Error::Protocol {
        message: format!("unparsable {what}: {raw:?}"),
    })
}

/// Parse full `x2golistsessions` (plus optional shadow-sessions) output
/// into a map keyed by session name.
///
/// Any corrupt line fails the whole parse with a `Protocol` error so the
/// caller can retry; partial listings are a known server race.
pub fn parse_session_list(output: &str) -> Result<HashMap<String, SessionInfo>> {
    let mut sessions = HashMap::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let info = SessionInfo::from_listing_line(line)?;
        sessions.insert(info.name.clone(), info);
    }
    Ok(sessions)
}

/// Session names sorted by creation timestamp, oldest first.
pub fn session_names_by_age(sessions: &HashMap<String, SessionInfo>) -> Vec<String> {
    let mut names: Vec<&SessionInfo> = sessions.values().collect();
    names.sort_by(|a, b| a.date_created.cmp(&b.date_created));
    names.into_iter().map(|s| s.name.clone()).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_LINE: &str = "24772|ada-50-1423563810_stDgnome-session_dp24|50|ada|S|2015-02-10T11:03:30|c3a9e67bc4f69a29f35b09e0871e1d747|unused|30001|30002|2015-02-10T11:05:31|1000|unused|30003";

    fn sample_info() -> SessionInfo {
        SessionInfo::from_listing_line(LISTING_LINE).unwrap()
    }

    #[test]
    fn parse_listing_line() {
        let info = sample_info();
        assert_eq!(info.agent_pid, 24772);
        assert_eq!(info.name, "ada-50-1423563810_stDgnome-session_dp24");
        assert_eq!(info.display, 50);
        assert_eq!(info.hostname, "ada");
        assert_eq!(info.status, RunState::Suspended);
        assert_eq!(info.graphics_port, 30001);
        assert_eq!(info.sound_port, 30002);
        assert_eq!(info.sshfs_port, 30003);
        assert_eq!(info.username, "1000");
        assert!(info.is_suspended());
        assert!(!info.is_running());
    }

    #[test]
    fn parse_listing_line_short_is_protocol_error() {
        let err = SessionInfo::from_listing_line("24772|name|50").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn parse_listing_line_garbage_port_is_protocol_error() {
        let line = LISTING_LINE.replace("30001", "3o001");
        let err = SessionInfo::from_listing_line(&line).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn parse_agent_output() {
        let output = "50\ncookie123\n24772\nada-50-1423563810_stDgnome-session_dp24\n30001\n30002\n30003\n";
        let info = SessionInfo::from_agent_output(output, "alice", "ada").unwrap();
        assert_eq!(info.display, 50);
        assert_eq!(info.cookie, "cookie123");
        assert_eq!(info.agent_pid, 24772);
        assert_eq!(info.graphics_port, 30001);
        assert!(info.is_running());
        assert_eq!(info.username, "alice");
    }

    #[test]
    fn parse_agent_output_truncated() {
        let err = SessionInfo::from_agent_output("50\ncookie\n", "u", "h").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn session_type_from_name() {
        let mut info = sample_info();
        assert_eq!(info.session_type(), SessionType::Desktop);
        assert!(info.is_desktop_session());

        info.name = "ada-51-1423563811_stRxterm_dp24".into();
        assert_eq!(info.session_type(), SessionType::Rootless);

        info.name = "ada-52-1423563812_stS0XSHADuserXSHAD50_dp24".into();
        assert_eq!(info.session_type(), SessionType::Shared);
        assert_eq!(info.share_mode(), Some('0'));

        info.name = "ada-53-1423563813_stRPUBLISHED_dp24".into();
        assert_eq!(info.session_type(), SessionType::Published);
        assert!(info.is_published_applications_provider());
    }

    #[test]
    fn color_depth_from_name() {
        assert_eq!(sample_info().color_depth_from_name(), Some(24));
    }

    #[test]
    fn resume_output_reallocates_ports() {
        let mut info = sample_info();
        let realloc = info
            .apply_resume_output("gr_port=31001\nsound_port=31002\nfs_port=31003\n")
            .unwrap();
        assert!(realloc.graphics_changed && realloc.sound_changed && realloc.sshfs_changed);
        assert_eq!(info.graphics_port, 31001);
        assert_eq!(info.sound_port, 31002);
        assert_eq!(info.sshfs_port, 31003);
    }

    #[test]
    fn resume_output_unchanged_ports_are_no_ops() {
        let mut info = sample_info();
        let realloc = info
            .apply_resume_output("gr_port=30001\nsound_port=30002\n")
            .unwrap();
        assert_eq!(realloc, PortReallocation::default());
    }

    #[test]
    fn resume_output_bad_graphics_port_is_fatal() {
        let mut info = sample_info();
        let err = info.apply_resume_output("gr_port=bogus\n").unwrap_err();
        assert!(matches!(err, Error::PortReallocationFailed));
    }

    #[test]
    fn resume_output_bad_sound_port_degrades() {
        let mut info = sample_info();
        let realloc = info.apply_resume_output("sound_port=bogus\n").unwrap();
        assert!(realloc.sound_lost);
        assert!(!realloc.sound_changed);
        // previous allocation stays untouched
        assert_eq!(info.sound_port, 30002);
    }

    #[test]
    fn protected_info_ignores_updates() {
        let mut info = sample_info();
        let mut fresh = sample_info();
        fresh.status = RunState::Running;
        fresh.graphics_port = 40000;

        info.protect();
        info.update_from(&fresh);
        assert_eq!(info.status, RunState::Suspended);
        assert_eq!(info.graphics_port, 30001);

        info.unprotect();
        info.update_from(&fresh);
        assert_eq!(info.status, RunState::Running);
        assert_eq!(info.graphics_port, 40000);
    }

    #[test]
    fn parse_session_list_multiple_lines() {
        let second = LISTING_LINE.replace("ada-50-1423563810", "ada-51-1423563999");
        let output = format!("{LISTING_LINE}\n{second}\n\n");
        let sessions = parse_session_list(&output).unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.contains_key("ada-50-1423563810_stDgnome-session_dp24"));
    }

    #[test]
    fn parse_session_list_corrupt_line_fails_whole_parse() {
        let output = format!("{LISTING_LINE}\ncorrupt|line\n");
        assert!(parse_session_list(&output).is_err());
    }

    #[test]
    fn names_by_age_sorts_on_creation_date() {
        let older = LISTING_LINE
            .replace("ada-50-1423563810", "ada-49-1423500000")
            .replace("2015-02-10T11:03:30", "2015-02-09T09:00:00");
        let sessions = parse_session_list(&format!("{LISTING_LINE}\n{older}\n")).unwrap();
        let names = session_names_by_age(&sessions);
        assert_eq!(names[0], "ada-49-1423500000_stDgnome-session_dp24");
    }
}
