//! Protocol and configuration constants for the x2go client engine.

use std::time::Duration;

// =============================================================================
// Wire Protocol Constants
// =============================================================================

/// Marker emitted before sanitized command output.
pub const DATA_BEGIN_MARKER: &str = "X2GODATABEGIN:";

/// Marker emitted after sanitized command output.
pub const DATA_END_MARKER: &str = "X2GODATAEND:";

/// PATH prefix forced onto every server-side command.
pub const SERVER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Token the server scripts expect in place of blanks inside one argument.
pub const SPACE_TOKEN: &str = "X2GO_SPACE_CHAR";

/// Macro replaced by the SSH-authenticated user name.
pub const USER_MACRO: &str = "X2GO_USER";

/// Macro replaced by the SSH authentication password.
pub const PASSWORD_MACRO: &str = "X2GO_PASSWORD";

/// Marker embedded in session names of published-applications providers.
pub const PUBLISHED_MARKER: &str = "_stRPUBLISHED_";

/// Infix between local path and reverse port in x2gomountdirs specs.
pub const REVERSE_PORT_MARKER: &str = "__REVERSESSH_PORT__";

/// Spool-folder marker for print-job shares.
pub const PRINT_SPOOL_MARKER: &str = "__PRINT_SPOOL__";

/// Spool-folder marker for MIME-box shares.
pub const MIMEBOX_SPOOL_MARKER: &str = "__MIMEBOX_SPOOL__";

/// Token separating user and display in desktop-sharing commands.
pub const SHADOW_TOKEN: &str = "XSHAD";

/// Command placeholder for published-applications provider sessions.
pub const PUBLISHED_CMD: &str = "PUBLISHED";

// =============================================================================
// Server Scripts
// =============================================================================

pub const CMD_START_AGENT: &str = "x2gostartagent";
pub const CMD_RESUME_SESSION: &str = "x2goresume-session";
pub const CMD_SUSPEND_SESSION: &str = "x2gosuspend-session";
pub const CMD_TERMINATE_SESSION: &str = "x2goterminate-session";
pub const CMD_LIST_SESSIONS: &str = "x2golistsessions";
pub const CMD_LIST_SHADOW_SESSIONS: &str = "x2golistshadowsessions";
pub const CMD_LIST_DESKTOPS: &str = "x2golistdesktops";
pub const CMD_LIST_MOUNTS: &str = "x2golistmounts";
pub const CMD_MOUNT_DIRS: &str = "x2gomountdirs";
pub const CMD_UMOUNT_SESSION: &str = "x2goumount-session";
pub const CMD_GET_APPS: &str = "x2gogetapps";
pub const CMD_RUN_COMMAND: &str = "x2goruncommand";
pub const CMD_VERSION: &str = "x2goversion";
pub const CMD_FEATURE_LIST: &str = "x2gofeaturelist";

// =============================================================================
// Server Features
// =============================================================================

/// Server supports shadow-session listing.
pub const FEATURE_LIST_SHADOW_SESSIONS: &str = "X2GO_LIST_SHADOWSESSIONS";

/// Server supports published applications.
pub const FEATURE_PUBLISHED_APPLICATIONS: &str = "X2GO_PUBLISHED_APPLICATIONS";

// =============================================================================
// Timing Constants
// =============================================================================

/// Deadline for a single exec or SFTP operation.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(20);

/// Deadline for the list-class commands (recoverable on expiry).
pub const LIST_TIMEOUT: Duration = Duration::from_secs(20);

/// SSH keep-alive interval on the control transport.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// TCP connect timeout for the SSH handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum interval between two session status updates per target.
pub const STATUS_UPDATE_THROTTLE: Duration = Duration::from_secs(1);

/// Minimum interval between automatic server-session registrations.
pub const AUTO_REGISTRATION_THROTTLE: Duration = Duration::from_secs(2);

/// Grace period after suspending an already-running session before resuming
/// it, giving the other client's SSH stack time to release its forwarded
/// channels.
pub const TAKEOVER_GRACE: Duration = Duration::from_secs(5);

/// Wait before a promoted desktop master session starts mounting folders.
pub const MASTER_PROMOTION_WAIT_DESKTOP: Duration = Duration::from_secs(1);

/// Wait before any other promoted master session starts mounting folders.
pub const MASTER_PROMOTION_WAIT_OTHER: Duration = Duration::from_secs(2);

// =============================================================================
// Listing Retry Policy
// =============================================================================

/// Default number of attempts against corrupt x2golistsessions output.
pub const LISTING_RETRY_ATTEMPTS: u32 = 20;

/// Default backoff between listing retry attempts.
pub const LISTING_RETRY_BACKOFF: Duration = Duration::from_secs(1);

// =============================================================================
// Default Values
// =============================================================================

/// Geometry used when `maximize` cannot be resolved against a local desktop.
pub const FALLBACK_GEOMETRY: &str = "1024x768";

/// Default local sound port (pulse).
pub const DEFAULT_SOUND_PORT: u16 = 4713;

/// Prefix of client-side per-session container directories.
pub const LOCAL_CONTAINER_PREFIX: &str = "S-";

/// Prefix of server-side per-session container directories.
pub const REMOTE_CONTAINER_PREFIX: &str = "C-";

/// Server-side session root directory below the remote home.
pub const REMOTE_SESSIONS_ROOTDIR: &str = ".x2go";

/// Menus with at most this many entries get flattened into the TOP level.
pub const PUBAPP_MAX_NO_SUBMENUS: usize = 10;
