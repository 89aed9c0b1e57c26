//! SSH transport fault classification.
//!
//! Key-based auth failures and connectivity problems are not reported by
//! SSH in any structured way; they only show up as text on the wrapped
//! agent's stdout. This module recognizes the known failure lines and turns
//! them into operator-readable diagnoses.

use shepherd_core::CommandSpec;

/// Default SSH port, used in diagnoses when the spec does not name one.
const DEFAULT_SSH_PORT: u16 = 22;

/// Check one line of agent output for a known SSH failure.
///
/// Returns an operator-facing diagnosis when the line matches, including
/// the offending line itself. A matched line must not be dispatched as a
/// protocol message.
pub fn classify_line(line: &str, spec: &CommandSpec) -> Option<String> {
    let host = spec.host.as_deref().unwrap_or("localhost");
    let diagnosis = if line.contains("password:") {
        format!(
            "The SSH server asks for a password. Make sure you use the right user name \
             and that your public SSH key is installed on the remote host {host}."
        )
    } else if line.contains("Enter passphrase for key") {
        format!(
            "The SSH client asks for a passphrase to unlock the local private key used \
             for host {host}. Unlock it once by hand so the supervisor is never prompted."
        )
    } else if line.contains("Connection refused") {
        let port = spec.ssh_port.unwrap_or(DEFAULT_SSH_PORT);
        format!("The SSH server is not running on port {port} of host {host} or not available.")
    } else if line.contains("No route to host") {
        format!("We cannot reach host {host}.")
    } else if line.contains("command not found") {
        format!("The agent executable is not installed on the host {host}.")
    } else if line.contains("ssh_exchange_identification") {
        format!(
            "An SSH problem occurred exchanging the identification on host {host}. \
             Is this machine blacklisted there?"
        )
    } else if line.contains("Could not resolve hostname") {
        format!("Could not resolve hostname {host}.")
    } else {
        return None;
    };

    Some(format!(
        "{diagnosis}\nThe line received from SSH is:\n{line}\nThis happened while launching {id}",
        id = spec.identifier
    ))
}
