//! Auth/transport shim (§4.5).
//!
//! Building the overlay map is a pure function of two optional hints; the
//! `ssh-agent` discovery helper is a standalone utility a host application
//! may call before constructing a `Client` — the `Client` itself never
//! invokes it (§4.4, supplement from `original_source`).

use std::collections::HashMap;

pub const SSH_AGENT_PID: &str = "SSH_AGENT_PID";
pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

/// Pre-discovered authentication-agent hints.
#[derive(Debug, Clone, Default)]
pub struct AuthHints {
    pub agent_pid: Option<String>,
    pub auth_sock: Option<String>,
}

/// Builds the environment overlay for outbound remote operations. Returns
/// an empty map unless both hints are present.
pub fn build_env_overlay(hints: &AuthHints) -> HashMap<String, String> {
    match (&hints.agent_pid, &hints.auth_sock) {
        (Some(pid), Some(sock)) => HashMap::from([
            (SSH_AGENT_PID.to_string(), pid.clone()),
            (SSH_AUTH_SOCK.to_string(), sock.clone()),
        ]),
        _ => HashMap::new(),
    }
}

/// Parses the stdout of an `ssh-agent -s`/`ssh-agent -c` invocation for the
/// agent pid and socket path, recognizing both the Bourne-shell variable
/// assignment form (`SSH_AGENT_PID=1234;`) and the OpenSSH csh/"Found"
/// phrasing (`Found ssh-agent at PID` / `Found ssh-agent socket at PATH`).
pub fn parse_ssh_agent_output(stdout: &str) -> AuthHints {
    let mut hints = AuthHints::default();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("SSH_AUTH_SOCK=") {
            hints.auth_sock = Some(take_until_semicolon(rest));
        } else if let Some(rest) = line.strip_prefix("SSH_AGENT_PID=") {
            hints.agent_pid = Some(take_until_semicolon(rest));
        } else if let Some(rest) = line.strip_prefix("Found ssh-agent socket at ") {
            hints.auth_sock = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Found ssh-agent at PID ") {
            hints.agent_pid = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Found ssh-agent at ") {
            hints.agent_pid = Some(rest.trim().trim_start_matches("PID ").to_string());
        }
    }
    hints
}

fn take_until_semicolon(s: &str) -> String {
    s.split(';').next().unwrap_or(s).trim().to_string()
}

/// Runs the `ssh-agent` helper and parses its output. Returns empty hints
/// if the helper is unavailable or exits non-zero.
pub fn discover_ssh_agent() -> AuthHints {
    match std::process::Command::new("ssh-agent").arg("-s").output() {
        Ok(output) if output.status.success() => {
            parse_ssh_agent_output(&String::from_utf8_lossy(&output.stdout))
        }
        _ => AuthHints::default(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn overlay_is_empty_without_both_hints() {
        let hints = AuthHints {
            agent_pid: Some("123".to_string()),
            auth_sock: None,
        };
        assert!(build_env_overlay(&hints).is_empty());
    }

    #[test]
    fn overlay_has_both_vars_when_fully_hinted() {
        let hints = AuthHints {
            agent_pid: Some("123".to_string()),
            auth_sock: Some("/tmp/agent.sock".to_string()),
        };
        let overlay = build_env_overlay(&hints);
        assert_eq!(overlay.get(SSH_AGENT_PID), Some(&"123".to_string()));
        assert_eq!(overlay.get(SSH_AUTH_SOCK), Some(&"/tmp/agent.sock".to_string()));
    }

    #[test]
    fn parses_bourne_shell_agent_output() {
        let stdout = "SSH_AUTH_SOCK=/tmp/ssh-abc/agent.123; export SSH_AUTH_SOCK;\n\
                       SSH_AGENT_PID=456; export SSH_AGENT_PID;\n\
                       echo Agent pid 456;\n";
        let hints = parse_ssh_agent_output(stdout);
        assert_eq!(hints.auth_sock.as_deref(), Some("/tmp/ssh-abc/agent.123"));
        assert_eq!(hints.agent_pid.as_deref(), Some("456"));
    }

    #[test]
    fn parses_openssh_found_phrasing() {
        let stdout = "Found ssh-agent socket at /tmp/ssh-xyz/agent.789\n\
                       Found ssh-agent at PID 789\n";
        let hints = parse_ssh_agent_output(stdout);
        assert_eq!(hints.auth_sock.as_deref(), Some("/tmp/ssh-xyz/agent.789"));
        assert_eq!(hints.agent_pid.as_deref(), Some("789"));
    }
}
