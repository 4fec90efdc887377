//! Remote shell bootstrap.
//!
//! The command runs three steps on the local side:
//! `ssh host mkdir -p <dir>`, `scp bastion.env run.sh host:<dir>/`, then
//! `exec ssh -tt host 'cd <dir> && sh run.sh'`. The remote script sources
//! the environment file, runs the job body and removes both files.

use crate::command::{CommandLine, Prompt, ScratchFile};
use crate::context::BuildContext;
use crate::env;
use crate::error::BuildError;
use crate::shell;
use bastion_core::Client;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Environment file name
pub const ENV_FILE: &str = "bastion.env";
/// Script file name
pub const SCRIPT_FILE: &str = "run.sh";

pub(crate) static SUDO_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[sudo\] password").expect("valid sudo prompt pattern"));
static SSH_PASSWORD_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)'s password:\s*$").expect("valid ssh prompt pattern"));
/// borg asking for the repository key passphrase
pub static BORG_PASSPHRASE_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Enter passphrase for key ").expect("valid borg prompt pattern"));

/// Builds a bootstrapped remote invocation
#[derive(Debug, Clone)]
pub struct RemoteBootstrap<'a> {
    ctx: BuildContext<'a>,
    host: &'a Client,
    body: Vec<String>,
    env: BTreeMap<String, String>,
    run_flags: Vec<String>,
}

impl<'a> RemoteBootstrap<'a> {
    /// Bootstrap onto `host`
    #[must_use]
    pub fn new(ctx: BuildContext<'a>, host: &'a Client) -> Self {
        Self {
            ctx,
            host,
            body: Vec::new(),
            env: env::agent_env(&ctx),
            run_flags: Vec::new(),
        }
    }

    /// Add environment entries for the remote script
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Extra flags for the session running the script, such as forwarding
    #[must_use]
    pub fn with_run_flags(mut self, flags: impl IntoIterator<Item = String>) -> Self {
        self.run_flags.extend(flags);
        self
    }

    /// Append a line to the remote script
    #[must_use]
    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.body.push(line.into());
        self
    }

    fn ssh_base(&self, program: &str, port_flag: &str) -> Vec<String> {
        let mut argv = vec![
            program.to_string(),
            port_flag.to_string(),
            self.host.port.to_string(),
        ];
        for option in &self.ctx.settings.ssh_options {
            argv.push("-o".to_string());
            argv.push(option.clone());
        }
        argv
    }

    fn script(&self) -> String {
        let mut script = String::from("#!/bin/sh\nset -eu\ncd \"$(dirname \"$0\")\"\n");
        script.push_str(&format!(". ./{}\n", ENV_FILE));
        script.push_str(&format!("trap 'rm -f {} {}' EXIT\n", ENV_FILE, SCRIPT_FILE));
        for line in &self.body {
            script.push_str(line);
            script.push('\n');
        }
        script
    }

    /// Produce the command line
    ///
    /// # Errors
    ///
    /// Returns error if the remote directory is empty
    pub fn build(self) -> Result<CommandLine, BuildError> {
        let host = self.host;
        let dir = host.remote_dir.trim_end_matches('/');
        if dir.is_empty() {
            return Err(BuildError::InvalidOptions {
                job: self.ctx.job.id,
                reason: format!("client {} has no remote directory", host.id),
            });
        }
        let target = host.ssh_target();
        let ssh = &self.ctx.settings.ssh;
        let scp = &self.ctx.settings.scp;

        let mut mkdir = self.ssh_base(ssh, "-p");
        mkdir.extend([target.clone(), format!("mkdir -p -m 700 {}", shell::quote(dir))]);

        let mut copy = self.ssh_base(scp, "-P");
        copy.extend([
            self.ctx.scratch_path(ENV_FILE),
            self.ctx.scratch_path(SCRIPT_FILE),
            format!("{}:{}/", target, dir),
        ]);

        let run_script = format!("sh {}/{}", dir, SCRIPT_FILE);
        let become_password = host.credentials.become_password.as_ref();
        let remote_command = if host.username != "root" && become_password.is_some() {
            format!("sudo -S -p '[sudo] password: ' {}", run_script)
        } else {
            run_script
        };
        let mut run = self.ssh_base(ssh, "-p");
        run.splice(1..1, std::iter::once("-tt".to_string()).chain(self.run_flags.iter().cloned()));
        run.extend([target, remote_command]);

        let pipeline = format!(
            "{} && {} && exec {}",
            shell::join(&mkdir),
            shell::join(&copy),
            shell::join(&run)
        );

        let credentials = &host.credentials;
        let cmd = CommandLine::new(vec!["sh".to_string(), "-c".to_string(), pipeline])
            .with_file(ScratchFile::private(ENV_FILE, env::env_file(&self.env)))
            .with_file(ScratchFile {
                name: SCRIPT_FILE.to_string(),
                contents: self.script().into(),
                mode: 0o700,
            })
            .with_optional_prompt(&SUDO_PROMPT, become_password)
            .with_optional_prompt(&SSH_PASSWORD_PROMPT, credentials.ssh_password.as_ref())
            .with_optional_prompt(&BORG_PASSPHRASE_PROMPT, self.ctx.repository_passphrase());
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ToolSettings;
    use bastion_core::{ClientId, Credentials, Job, JobId, JobType, LaunchType, Secret};
    use std::path::Path;

    fn host(user: &str) -> Client {
        Client {
            id: ClientId::new(1),
            hostname: "web1".into(),
            port: 2222,
            username: user.into(),
            enabled: true,
            ready: true,
            hypervisor_id: None,
            remote_dir: "/tmp/.bastion/".into(),
            credentials: Credentials {
                ssh_password: Some(Secret::new("sshpw")),
                become_password: Some(Secret::new("sudopw")),
                ..Credentials::default()
            },
        }
    }

    #[test]
    fn test_bootstrap_shape() {
        let job = Job::new(JobId::new(3), JobType::Backup, LaunchType::Manual);
        let settings = ToolSettings::default();
        let client = host("backup");
        let ctx = BuildContext::new(&job, Path::new("/run/bastion/x"), &settings);
        let cmd = RemoteBootstrap::new(ctx, &client)
            .line("borg --version")
            .build()
            .unwrap();

        assert_eq!(&cmd.argv[..2], &["sh", "-c"]);
        let pipeline = &cmd.argv[2];
        assert!(pipeline.starts_with("ssh -p 2222"));
        assert!(pipeline.contains("scp -P 2222"));
        assert!(pipeline.contains("/run/bastion/x/bastion.env /run/bastion/x/run.sh backup@web1:/tmp/.bastion/"));
        assert!(pipeline.contains("exec ssh -tt -p 2222"));
        assert!(pipeline.contains("sudo -S"));
        assert!(!pipeline.contains("sshpw"));

        let names: Vec<_> = cmd.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![ENV_FILE, SCRIPT_FILE]);
        assert!(cmd.files[1].contents.expose().contains("borg --version"));
        assert_eq!(cmd.prompts.len(), 2);
    }

    #[test]
    fn test_root_runs_without_sudo() {
        let job = Job::new(JobId::new(3), JobType::Backup, LaunchType::Manual);
        let settings = ToolSettings::default();
        let client = host("root");
        let ctx = BuildContext::new(&job, Path::new("/tmp/s"), &settings);
        let cmd = RemoteBootstrap::new(ctx, &client).build().unwrap();
        assert!(!cmd.argv[2].contains("sudo"));
    }

    #[test]
    fn test_prompt_patterns() {
        assert!(SUDO_PROMPT.is_match("[sudo] password: "));
        assert!(SSH_PASSWORD_PROMPT.is_match("backup@web1's password: "));
        assert!(!SSH_PASSWORD_PROMPT.is_match("[sudo] password: "));
        assert!(BORG_PASSPHRASE_PROMPT.is_match("Enter passphrase for key /srv/repo: "));
    }
}
