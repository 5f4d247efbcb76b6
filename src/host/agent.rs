//! Agent subprocess management for the session host.
//!
//! Spawns the agent CLI in streaming-JSON mode with its stdio piped, scrubs
//! credentials that would flip it onto a different billing path, and passes
//! the resume identifier when one is known.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::AgentCliConfig;
use crate::error::HostError;

/// Environment variables removed before spawning so the agent stays on its
/// subscription billing path.
const STRIPPED_ENV: &[&str] = &["ANTHROPIC_API_KEY", "ANTHROPIC_AUTH_TOKEN"];

/// Mirrored agent stderr lines are cut to this many bytes.
pub const STDERR_TRUNCATE_BYTES: usize = 500;

/// A freshly spawned agent with its stdio split out.
pub struct SpawnedAgent {
    pub child: Child,
    pub pid: u32,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn the agent binary, optionally resuming a prior session.
pub fn spawn_agent(
    config: &AgentCliConfig,
    workdir: &Path,
    resume: Option<&str>,
) -> Result<SpawnedAgent, HostError> {
    let mut command = Command::new(&config.binary);
    command
        .args(build_agent_args(config, resume))
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for key in STRIPPED_ENV {
        command.env_remove(key);
    }
    command.env("CLAUDECODE", "1");
    command.env("CLAUDE_CODE_ENTRYPOINT", "clawmux");

    let mut child = command.spawn().map_err(|source| HostError::AgentSpawn {
        binary: config.binary.clone(),
        source,
    })?;

    let pid = child.id().unwrap_or_default();
    let stdin = child.stdin.take().ok_or_else(|| {
        HostError::Io(std::io::Error::other("agent stdin was not piped"))
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        HostError::Io(std::io::Error::other("agent stdout was not piped"))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        HostError::Io(std::io::Error::other("agent stderr was not piped"))
    })?;

    tracing::info!(binary = %config.binary, pid, resume = resume.is_some(), "agent spawned");

    Ok(SpawnedAgent {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// Build the agent's argument vector. `base_args` come first so tests can
/// substitute a scripted binary that ignores the protocol flags.
pub fn build_agent_args(config: &AgentCliConfig, resume: Option<&str>) -> Vec<String> {
    let mut args = config.base_args.clone();
    args.extend(
        [
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
        ]
        .map(String::from),
    );
    args.push("--max-turns".to_string());
    args.push(config.max_turns.to_string());
    if !config.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(config.allowed_tools.join(","));
    }
    if let Some(prompt) = &config.append_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    if let Some(session_id) = resume {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }
    args
}

/// Stderr noise the host keeps out of the mirrored `_stderr` events. These
/// still land in the per-channel stderr log file.
pub fn is_noisy_stderr(line: &str) -> bool {
    line.contains("DeprecationWarning")
        || line.contains("ExperimentalWarning")
        || line.trim().is_empty()
}

/// Cut a line to `max` bytes on a char boundary.
pub fn truncate_bytes(line: &str, max: usize) -> &str {
    if line.len() <= max {
        return line;
    }
    let mut end = max;
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentCliConfig {
        AgentCliConfig {
            binary: "claude".into(),
            base_args: Vec::new(),
            max_turns: 25,
            allowed_tools: vec!["Bash".into(), "Read".into()],
            append_system_prompt: None,
        }
    }

    #[test]
    fn args_without_resume() {
        let args = build_agent_args(&config(), None);
        assert_eq!(
            args,
            vec![
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
                "--max-turns",
                "25",
                "--allowedTools",
                "Bash,Read",
            ]
        );
    }

    #[test]
    fn resume_flag_appended_when_known() {
        let args = build_agent_args(&config(), Some("sess-9"));
        let resume_at = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_at + 1], "sess-9");
    }

    #[test]
    fn system_prompt_appended_when_configured() {
        let mut cfg = config();
        cfg.append_system_prompt = Some("stay terse".into());
        let args = build_agent_args(&cfg, None);
        let at = args.iter().position(|a| a == "--append-system-prompt").unwrap();
        assert_eq!(args[at + 1], "stay terse");
    }

    #[test]
    fn base_args_come_first() {
        let mut cfg = config();
        cfg.binary = "sh".into();
        cfg.base_args = vec!["-c".into(), "cat".into()];
        let args = build_agent_args(&cfg, None);
        assert_eq!(&args[..2], &["-c", "cat"]);
    }

    #[test]
    fn empty_tool_list_omits_the_flag() {
        let mut cfg = config();
        cfg.allowed_tools.clear();
        let args = build_agent_args(&cfg, None);
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn noisy_stderr_is_filtered() {
        assert!(is_noisy_stderr("(node:42) DeprecationWarning: ..."));
        assert!(is_noisy_stderr("   "));
        assert!(!is_noisy_stderr("Error: something real"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_bytes("hello", 10), "hello");
        assert_eq!(truncate_bytes("hello", 3), "hel");
        // "é" is two bytes; cutting mid-char backs up.
        assert_eq!(truncate_bytes("aé", 2), "a");
    }
}
