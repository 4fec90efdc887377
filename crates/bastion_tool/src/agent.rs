//! ssh-agent wrapping.
//!
//! When a key is staged, the command runs under a private agent:
//! `ssh-agent sh -c 'ssh-add "$1" && shift && exec "$@"' bastion-agent <key>
//! <argv...>`. `ssh-add` reads the key from its pipe exactly once.

use crate::command::{CommandLine, Prompt};
use bastion_core::Secret;
use std::path::Path;

const AGENT_SCRIPT: &str = r#"ssh-add "$1" && shift && exec "$@""#;

/// Wrap `cmd` so it runs with `key` loaded in a fresh agent
///
/// A key passphrase, when given, is answered at the `ssh-add` prompt.
///
/// # Errors
///
/// Returns error if the key path cannot be turned into a prompt pattern
pub fn wrap_with_agent(
    cmd: &mut CommandLine,
    key: &Path,
    passphrase: Option<&Secret>,
) -> Result<(), regex::Error> {
    let key = key.display().to_string();
    let prefix = [
        "ssh-agent".to_string(),
        "sh".to_string(),
        "-c".to_string(),
        AGENT_SCRIPT.to_string(),
        "bastion-agent".to_string(),
        key.clone(),
    ];
    cmd.argv.splice(0..0, prefix.iter().cloned());
    cmd.display_argv.splice(0..0, prefix);

    if let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) {
        let prompt = Prompt::literal(&format!("Enter passphrase for {}", key), passphrase.clone())?;
        cmd.prompts.insert(0, prompt);
    }
    Ok(())
}
