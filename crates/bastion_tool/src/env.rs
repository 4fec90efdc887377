//! Process environment.
//!
//! Repository-side commands get the passphrase in `BORG_PASSPHRASE`.
//! Remote commands never do: borg on the remote host prompts for it and the
//! prompt table answers.

use crate::context::BuildContext;
use crate::error::BuildError;
use crate::shell;
use std::collections::BTreeMap;

/// Repository location and non-interactive borg switches
///
/// # Errors
///
/// Returns error if the job has no repository
pub fn repository_env(
    ctx: &BuildContext<'_>,
    with_passphrase: bool,
) -> Result<BTreeMap<String, String>, BuildError> {
    let repository = ctx.require_repository()?;
    let mut env = BTreeMap::new();
    env.insert("BORG_REPO".to_string(), repository.url.clone());
    env.insert("BORG_RELOCATED_REPO_ACCESS_IS_OK".to_string(), "yes".to_string());
    env.insert("BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK".to_string(), "no".to_string());
    let mut rsh = vec![ctx.settings.ssh.clone()];
    for option in &ctx.settings.ssh_options {
        rsh.push("-o".to_string());
        rsh.push(option.clone());
    }
    env.insert("BORG_RSH".to_string(), shell::join(&rsh));
    if with_passphrase {
        if let Some(passphrase) = ctx.repository_passphrase() {
            env.insert("BORG_PASSPHRASE".to_string(), passphrase.expose().to_string());
        }
    }
    Ok(env)
}

/// Callback location, job identity and timeout knobs
#[must_use]
pub fn agent_env(ctx: &BuildContext<'_>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("BASTION_JOB_ID".to_string(), ctx.job.id.as_u64().to_string());
    env.insert("BASTION_JOB_TYPE".to_string(), ctx.job.job_type.to_string());
    if let Some(url) = &ctx.settings.base_url {
        env.insert("BASTION_URL".to_string(), url.trim_end_matches('/').to_string());
    }
    if let Some(token) = &ctx.settings.token {
        env.insert("BASTION_TOKEN".to_string(), token.expose().to_string());
    }
    env.insert("BASTION_TIMEOUT".to_string(), ctx.settings.timeout_secs.to_string());
    env.insert(
        "BASTION_IDLE_TIMEOUT".to_string(),
        ctx.settings.idle_timeout_secs.to_string(),
    );
    env
}

/// Render an environment as a sourceable file
#[must_use]
pub fn env_file(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("export {}={}\n", key, shell::quote(value)))
        .collect()
}
