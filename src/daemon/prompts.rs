//! System prompt construction.
//!
//! The daemon runs on the same host as its clients, so it describes that
//! host once at startup and bakes it into the system instruction.

/// Follow-up instruction for a response that came back without a fence.
pub const REFORMAT_INSTRUCTION: &str =
    "Reformat the above to use a fenced code block (```bash ... ```) containing only the command.";

/// Host facts that steer command generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Operating system, e.g. "macOS 14.5" or "Ubuntu 22.04.4 LTS".
    pub os: String,
    /// The user's shell (from $SHELL).
    pub shell: String,
}

impl HostContext {
    /// Detect the OS name and the user's shell.
    pub fn gather() -> Self {
        Self {
            os: get_os_name(),
            shell: get_shell(),
        }
    }

    /// Build the system instruction for this host.
    pub fn system_prompt(&self) -> String {
        format!(
            r#"You are a command-line expert that provides precise {os} terminal commands. Follow these rules strictly:
1. Respond ONLY with the exact command(s) needed - no explanations
2. Use standard commands available on {os} (ls, grep, find, etc.)
3. Each command must be valid and complete
4. Keep responses short and focused
5. ALWAYS enclose commands in triple backticks with the appropriate language tag (e.g. ```bash)
6. End your response immediately after the closing backticks
7. Never add commentary or notes
8. Never repeat yourself or provide alternatives
9. Always provide a single, definitive answer - do not list multiple options
10. Choose the most appropriate and efficient solution when multiple approaches exist
11. Write commands for the {shell} shell unless the prompt asks for another language
12. DO NOT provide multiple answers, only one answer is allowed"#,
            os = self.os,
            shell = self.shell,
        )
    }
}

fn get_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .and_then(|s| s.rsplit('/').next().map(str::to_string))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "sh".to_string())
}

#[cfg(target_os = "linux")]
fn get_os_name() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|contents| parse_pretty_name(&contents))
        .unwrap_or_else(|| "Linux".to_string())
}

#[cfg(target_os = "macos")]
fn get_os_name() -> String {
    use std::process::Command;
    match Command::new("sw_vers").arg("-productVersion").output() {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            format!("macOS {}", version)
        }
        _ => "macOS".to_string(),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn get_os_name() -> String {
    std::env::consts::OS.to_string()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}
