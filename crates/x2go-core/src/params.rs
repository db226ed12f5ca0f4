//! Client-supplied session configuration and session-type derivation.

use crate::constants::{FALLBACK_GEOMETRY, PUBLISHED_CMD, SHADOW_TOKEN};

/// Meta-commands for window manager sessions and the commands they map to.
pub const DESKTOP_SESSIONS: &[(&str, &str)] = &[
    ("CINNAMON", "cinnamon"),
    ("KDE", "startkde"),
    ("GNOME", "gnome-session"),
    ("MATE", "mate-session"),
    ("XFCE", "xfce4-session"),
    ("LXDE", "startlxde"),
    ("TRINITY", "starttrinity"),
    ("UNITY", "unity"),
];

/// Generic application placeholders the server resolves itself.
pub const GENERIC_APPLICATIONS: &[&str] = &["WWWBROWSER", "MAILCLIENT", "OFFICE", "TERMINAL"];

/// The four terminal session modes, encoded into server command lines as
/// single characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    /// Full remote desktop (`D`).
    Desktop,
    /// Single-application / rootless session (`R`).
    #[default]
    Rootless,
    /// Shared (shadowed) desktop of another session (`S`).
    Shared,
    /// Published-applications provider (`P`).
    Published,
}

impl SessionType {
    /// The single-character encoding used on server command lines.
    pub fn as_char(self) -> char {
        match self {
            SessionType::Desktop => 'D',
            SessionType::Rootless => 'R',
            SessionType::Shared => 'S',
            SessionType::Published => 'P',
        }
    }

    /// Parse explicit configuration values (`desktop`, `D`, `shared`, ...).
    pub fn from_config(value: &str) -> Option<Self> {
        match value {
            "D" | "desktop" => Some(SessionType::Desktop),
            "S" | "shared" | "shadow" => Some(SessionType::Shared),
            "R" | "rootless" | "application" => Some(SessionType::Rootless),
            "P" | "published" | "published_applications" => Some(SessionType::Published),
            _ => None,
        }
    }
}

/// Desired configuration for one terminal session.
///
/// Immutable input to terminal session construction; the effective session
/// type is derived via [`SessionParams::session_type`].
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Screen geometry: `<width>x<height>`, `fullscreen` or `maximize`.
    pub geometry: String,
    /// Link quality: `modem`, `isdn`, `adsl`, `wan` or `lan`.
    pub link: String,
    /// NX compression method.
    pub pack: String,
    /// Color depth in bits.
    pub depth: u8,
    /// Dots-per-inch override, empty for server default.
    pub dpi: String,
    /// NX cache directory name.
    pub cache_type: String,
    /// Explicitly requested session type, if any.
    pub session_type: Option<SessionType>,
    /// Keyboard type, e.g. `pc105/us`.
    pub kbtype: String,
    /// Keyboard layout, e.g. `us`.
    pub kblayout: String,
    /// Keyboard variant, e.g. `nodeadkeys`.
    pub kbvariant: String,
    /// Clipboard mode: `both`, `server`, `client` or `none`.
    pub clipboard: String,
    /// Sound system on the server: `pulse`, `esd` or `none`.
    pub sound_system: String,
    /// Local sound port.
    pub sound_port: u16,
    /// Command to run in the session.
    pub cmd: String,
    /// Session is a published-applications provider.
    pub published_applications: bool,
    /// Modify the session window title.
    pub set_session_title: bool,
    /// Explicit session window title.
    pub session_title: String,
    /// Server-side RDP server for proxy mode.
    pub rdp_server: String,
    /// Options for the rdesktop command in RDP proxy mode.
    pub rdp_options: String,
    /// XDMCP server to connect the session to.
    pub xdmcp_server: String,
    /// Convert file system encodings for shared folders.
    pub convert_encoding: bool,
    /// Server-side file system encoding.
    pub server_encoding: String,
    /// Client-side file system encoding.
    pub client_encoding: String,
    /// Client-side session root directory.
    pub rootdir: String,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            geometry: "800x600".into(),
            link: "adsl".into(),
            pack: "16m-jpeg-9".into(),
            depth: 24,
            dpi: String::new(),
            cache_type: "unix-kde".into(),
            session_type: None,
            kbtype: "null/null".into(),
            kblayout: "null".into(),
            kbvariant: "null".into(),
            clipboard: "both".into(),
            sound_system: "pulse".into(),
            sound_port: crate::constants::DEFAULT_SOUND_PORT,
            cmd: String::new(),
            published_applications: false,
            set_session_title: false,
            session_title: String::new(),
            rdp_server: String::new(),
            rdp_options: String::new(),
            xdmcp_server: String::new(),
            convert_encoding: false,
            server_encoding: "UTF-8".into(),
            client_encoding: "UTF-8".into(),
            rootdir: String::new(),
        }
    }
}

impl SessionParams {
    /// Derive the effective session type.
    ///
    /// Precedence: explicit type > published-applications flag > command
    /// heuristics (window manager meta-commands and XDMCP are desktops,
    /// RDP depends on fullscreen geometry). Everything else is rootless.
    pub fn session_type(&self) -> SessionType {
        if self.published_applications && (self.cmd.is_empty() || self.cmd == PUBLISHED_CMD) {
            return SessionType::Published;
        }
        if let Some(explicit) = self.session_type {
            return explicit;
        }
        let cmd = self.cmd.as_str();
        if cmd == "RDP" || cmd.starts_with("rdesktop") || cmd.starts_with("xfreerdp") {
            if self.geometry == "fullscreen" {
                return SessionType::Desktop;
            }
            return SessionType::Rootless;
        }
        if cmd == "XDMCP" {
            return SessionType::Desktop;
        }
        if cmd.contains(SHADOW_TOKEN) {
            return SessionType::Shared;
        }
        if DESKTOP_SESSIONS.iter().any(|(meta, _)| *meta == cmd) {
            return SessionType::Desktop;
        }
        let base = basename(cmd);
        if DESKTOP_SESSIONS.iter().any(|(_, wm)| *wm == base) {
            return SessionType::Desktop;
        }
        SessionType::Rootless
    }

    /// Rewrite the configured command into what `x2goruncommand` expects.
    ///
    /// Window manager meta-commands map to the real session command, `RDP`
    /// is synthesized into an rdesktop invocation, non-empty commands get
    /// quoted, and an empty command of a published provider becomes
    /// `PUBLISHED`.
    pub fn rewrite_command(&self) -> String {
        let mut cmd = self.cmd.clone();

        if let Some((_, wm)) = DESKTOP_SESSIONS.iter().find(|(meta, _)| *meta == cmd) {
            cmd = (*wm).to_owned();
        }

        if cmd == "RDP" {
            // rdesktop does not know depth 17
            let depth = if self.depth == 17 { 16 } else { self.depth };
            cmd = if self.geometry == "fullscreen" {
                format!("rdesktop -f -N {} {} -a {}", self.rdp_options, self.rdp_server, depth)
            } else {
                format!(
                    "rdesktop -g {} -N {} {} -a {}",
                    self.geometry, self.rdp_options, self.rdp_server, depth
                )
            };
        }

        if !cmd.is_empty() {
            cmd = format!("\"{cmd}\"");
        }

        if self.published_applications && cmd.is_empty() {
            cmd = PUBLISHED_CMD.to_owned();
        }

        cmd
    }

    /// Resolve the `maximize` geometry against the local work area.
    ///
    /// `work_area` is the client-side desktop geometry in pixels, if known.
    /// Falls back to a fixed safe geometry when it is not.
    pub fn effective_geometry(&self, work_area: Option<(u32, u32)>) -> String {
        if self.geometry != "maximize" {
            return self.geometry.clone();
        }
        match work_area {
            Some((w, h)) => format!("{w}x{h}"),
            None => FALLBACK_GEOMETRY.to_owned(),
        }
    }

    /// The `1`/`0` flag telling the server whether to configure a keyboard.
    pub fn setkbd_flag(&self) -> &'static str {
        if self.kbtype == "null/null" {
            "0"
        } else {
            "1"
        }
    }

    /// True when a keyboard layout/variant should be applied after startup.
    pub fn wants_keyboard_setup(&self) -> bool {
        !matches!(self.kbtype.as_str(), "null/null" | "auto")
            && (!matches!(self.kblayout.as_str(), "null" | "")
                || !matches!(self.kbvariant.as_str(), "null" | ""))
    }

    /// True when the session runs in low-latency mode (weak links double
    /// all command timeouts).
    pub fn low_latency(&self) -> bool {
        matches!(self.link.as_str(), "modem" | "isdn")
    }
}

/// Last path component of a command line's executable.
pub fn basename(cmd: &str) -> &str {
    let exe = cmd.split_whitespace().next().unwrap_or("");
    exe.rsplit('/').next().unwrap_or(exe)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_flag_wins_over_heuristics() {
        let params = SessionParams {
            published_applications: true,
            cmd: String::new(),
            ..Default::default()
        };
        assert_eq!(params.session_type(), SessionType::Published);

        // but an explicit non-published command overrides the flag
        let params = SessionParams {
            published_applications: true,
            cmd: "xterm".into(),
            ..Default::default()
        };
        assert_eq!(params.session_type(), SessionType::Rootless);
    }

    #[test]
    fn explicit_type_wins_over_command() {
        let params = SessionParams {
            session_type: Some(SessionType::Shared),
            cmd: "GNOME".into(),
            ..Default::default()
        };
        assert_eq!(params.session_type(), SessionType::Shared);
    }

    #[test]
    fn window_manager_commands_are_desktops() {
        for meta in ["KDE", "GNOME", "XFCE", "MATE"] {
            let params = SessionParams {
                cmd: meta.into(),
                ..Default::default()
            };
            assert_eq!(params.session_type(), SessionType::Desktop, "{meta}");
        }
        let params = SessionParams {
            cmd: "/usr/bin/gnome-session".into(),
            ..Default::default()
        };
        assert_eq!(params.session_type(), SessionType::Desktop);
    }

    #[test]
    fn rdp_type_depends_on_fullscreen() {
        let mut params = SessionParams {
            cmd: "RDP".into(),
            ..Default::default()
        };
        assert_eq!(params.session_type(), SessionType::Rootless);
        params.geometry = "fullscreen".into();
        assert_eq!(params.session_type(), SessionType::Desktop);
    }

    #[test]
    fn xdmcp_is_a_desktop() {
        let params = SessionParams {
            cmd: "XDMCP".into(),
            ..Default::default()
        };
        assert_eq!(params.session_type(), SessionType::Desktop);
    }

    #[test]
    fn rewrite_maps_window_managers() {
        let params = SessionParams {
            cmd: "KDE".into(),
            ..Default::default()
        };
        assert_eq!(params.rewrite_command(), "\"startkde\"");
    }

    #[test]
    fn rewrite_synthesizes_rdesktop() {
        let params = SessionParams {
            cmd: "RDP".into(),
            geometry: "800x600".into(),
            rdp_server: "winsrv".into(),
            rdp_options: "-u X2GO_USER".into(),
            depth: 17,
            ..Default::default()
        };
        assert_eq!(
            params.rewrite_command(),
            "\"rdesktop -g 800x600 -N -u X2GO_USER winsrv -a 16\""
        );
    }

    #[test]
    fn rewrite_empty_published_is_published() {
        let params = SessionParams {
            published_applications: true,
            ..Default::default()
        };
        assert_eq!(params.rewrite_command(), "PUBLISHED");
    }

    #[test]
    fn maximize_geometry_resolution() {
        let params = SessionParams {
            geometry: "maximize".into(),
            ..Default::default()
        };
        assert_eq!(params.effective_geometry(Some((1920, 1080))), "1920x1080");
        assert_eq!(params.effective_geometry(None), "1024x768");

        let params = SessionParams::default();
        assert_eq!(params.effective_geometry(Some((1920, 1080))), "800x600");
    }

    #[test]
    fn keyboard_flags() {
        let params = SessionParams::default();
        assert_eq!(params.setkbd_flag(), "0");
        assert!(!params.wants_keyboard_setup());

        let params = SessionParams {
            kbtype: "pc105/de".into(),
            kblayout: "de".into(),
            kbvariant: "nodeadkeys".into(),
            ..Default::default()
        };
        assert_eq!(params.setkbd_flag(), "1");
        assert!(params.wants_keyboard_setup());
    }

    #[test]
    fn low_latency_links() {
        for (link, expected) in [("modem", true), ("isdn", true), ("adsl", false), ("lan", false)] {
            let params = SessionParams {
                link: link.into(),
                ..Default::default()
            };
            assert_eq!(params.low_latency(), expected, "{link}");
        }
    }

    #[test]
    fn basename_handles_paths_and_arguments() {
        assert_eq!(basename("/usr/bin/xterm -fg white"), "xterm");
        assert_eq!(basename("xterm"), "xterm");
        assert_eq!(basename(""), "");
    }
}
