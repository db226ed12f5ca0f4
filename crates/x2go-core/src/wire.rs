//! Command wrapping and output sanitizing for the exec channel.
//!
//! The x2go server scripts communicate over plain SSH exec channels. Shell
//! rc files on the server may echo arbitrary noise into stdout, so every
//! command is bracketed by marker lines and everything outside the marker
//! pair is discarded on the client side.

use crate::constants::{
    DATA_BEGIN_MARKER, DATA_END_MARKER, PASSWORD_MACRO, SERVER_PATH, SPACE_TOKEN, USER_MACRO,
};

/// Wrap a command line between begin/end markers for sanitized execution.
///
/// The marker id must be unique per invocation (a v4 UUID in practice) so
/// that replayed output from a previous command cannot be mistaken for the
/// current one.
pub fn wrap_command(cmd: &str, marker_id: &str) -> String {
    format!(
        "echo {begin}{id}; PATH={path} sh -c \"{cmd}\"; echo {end}{id}",
        begin = DATA_BEGIN_MARKER,
        end = DATA_END_MARKER,
        id = marker_id,
        path = SERVER_PATH,
        cmd = cmd,
    )
}

/// Strip everything outside the marker pair from raw stdout.
///
/// Lines before the begin marker and after the end marker are dropped, the
/// marker lines themselves included. If the begin marker never appears the
/// result is empty; if the end marker is missing everything after the begin
/// marker is kept (the deadline logic deals with truncated output).
pub fn sanitize_output(raw: &str, marker_id: &str) -> String {
    let begin = format!("{}{}", DATA_BEGIN_MARKER, marker_id);
    let end = format!("{}{}", DATA_END_MARKER, marker_id);

    let mut sanitized = String::new();
    let mut in_data = false;
    for line in raw.split('\n') {
        if line.starts_with(&begin) {
            in_data = true;
            continue;
        }
        if !in_data {
            continue;
        }
        if line.starts_with(&end) {
            break;
        }
        sanitized.push_str(line);
        sanitized.push('\n');
    }
    sanitized
}

/// Rewrite blanks to the server-side space token.
///
/// Server scripts split their argument vectors on blanks, so multi-word
/// arguments have to be re-encoded before being passed through.
pub fn encode_spaces(cmd: &str) -> String {
    cmd.replace(' ', SPACE_TOKEN)
}

/// Re-replace the space token with blanks (used for log output).
pub fn decode_spaces(cmd: &str) -> String {
    cmd.replace(SPACE_TOKEN, " ")
}

/// Replace the user/password macros with the actual SSH credentials.
///
/// Both macros exist for on-the-fly authentication of RDP proxy commands
/// running inside the session.
pub fn substitute_credentials(cmd: &str, user: Option<&str>, password: Option<&str>) -> String {
    let mut cmd = cmd.to_owned();
    if let Some(user) = user {
        cmd = cmd.replace(USER_MACRO, user);
    }
    if let Some(password) = password {
        cmd = cmd.replace(PASSWORD_MACRO, password);
    }
    cmd
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "6b3c1c1e-5f67-4711-9d35-000000000001";

    #[test]
    fn wrap_command_brackets_with_markers() {
        let wrapped = wrap_command("x2golistsessions", ID);
        assert!(wrapped.starts_with(&format!("echo X2GODATABEGIN:{ID}; ")));
        assert!(wrapped.ends_with(&format!("; echo X2GODATAEND:{ID}")));
        assert!(wrapped.contains("PATH=/usr/local/bin:/usr/bin:/bin sh -c \"x2golistsessions\""));
    }

    #[test]
    fn sanitize_strips_rc_file_noise() {
        let raw = format!(
            "motd garbage\nfrom .bashrc\nX2GODATABEGIN:{ID}\nline one\nline two\nX2GODATAEND:{ID}\ntrailing noise\n"
        );
        assert_eq!(sanitize_output(&raw, ID), "line one\nline two\n");
    }

    #[test]
    fn sanitize_without_begin_marker_is_empty() {
        assert_eq!(sanitize_output("no markers at all\n", ID), "");
    }

    #[test]
    fn sanitize_without_end_marker_keeps_tail() {
        let raw = format!("X2GODATABEGIN:{ID}\npartial output\n");
        assert_eq!(sanitize_output(&raw, ID), "partial output\n");
    }

    #[test]
    fn sanitize_ignores_markers_of_other_invocations() {
        let other = "11111111-2222-3333-4444-555555555555";
        let raw = format!(
            "X2GODATABEGIN:{other}\nstale\nX2GODATAEND:{other}\nX2GODATABEGIN:{ID}\nfresh\nX2GODATAEND:{ID}\n"
        );
        assert_eq!(sanitize_output(&raw, ID), "fresh\n");
    }

    #[test]
    fn sanitize_never_leaks_outside_bytes() {
        // fuzz-ish: arbitrary noise around the markers must never survive
        let noises = ["", "\n", "X2GODATAEND:", "binary\x07junk", "a\nb\nc"];
        for pre in noises {
            for post in noises {
                let raw = format!("{pre}\nX2GODATABEGIN:{ID}\npayload\nX2GODATAEND:{ID}\n{post}");
                assert_eq!(sanitize_output(&raw, ID), "payload\n", "pre={pre:?} post={post:?}");
            }
        }
    }

    #[test]
    fn space_token_round_trip() {
        let cmd = "rdesktop -g 800x600 host";
        let encoded = encode_spaces(cmd);
        assert!(!encoded.contains(' '));
        assert_eq!(decode_spaces(&encoded), cmd);
    }

    #[test]
    fn credential_macros_are_substituted() {
        let cmd = "rdesktop -u X2GO_USER -p X2GO_PASSWORD server";
        let rewritten = substitute_credentials(cmd, Some("alice"), Some("s3cret"));
        assert_eq!(rewritten, "rdesktop -u alice -p s3cret server");
    }

    #[test]
    fn credential_macros_left_alone_without_values() {
        let cmd = "rdesktop -u X2GO_USER server";
        assert_eq!(substitute_credentials(cmd, None, None), cmd);
    }
}
