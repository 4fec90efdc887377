//! Inputs to a builder.

use crate::error::BuildError;
use bastion_core::{Client, Job, Policy, PolicyType, Repository, Secret};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Program names and callback settings shared by all builders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// borg executable
    pub borg: String,
    /// ssh executable
    pub ssh: String,
    /// scp executable
    pub scp: String,
    /// Base URL remote agents call back to
    pub base_url: Option<String>,
    /// Bearer token for callbacks
    #[serde(skip_serializing)]
    pub token: Option<Secret>,
    /// Hard timeout passed to remote scripts (0 = none)
    pub timeout_secs: u64,
    /// Idle timeout passed to remote scripts (0 = none)
    pub idle_timeout_secs: u64,
    /// Extra `-o` options for ssh and scp
    pub ssh_options: Vec<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            borg: "borg".to_string(),
            ssh: "ssh".to_string(),
            scp: "scp".to_string(),
            base_url: None,
            token: None,
            timeout_secs: 0,
            idle_timeout_secs: 0,
            ssh_options: vec![
                "StrictHostKeyChecking=accept-new".to_string(),
                "ServerAliveInterval=30".to_string(),
            ],
        }
    }
}

/// Everything a builder may read
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    /// Job being built
    pub job: &'a Job,
    /// Policy the job was expanded from
    pub policy: Option<&'a Policy>,
    /// Client the job acts on
    pub client: Option<&'a Client>,
    /// Hypervisor of the client (VM policies)
    pub hypervisor: Option<&'a Client>,
    /// Repository the job acts on
    pub repository: Option<&'a Repository>,
    /// Scratch directory the command runs in
    pub scratch_dir: &'a Path,
    /// Key staged in the scratch directory, if any
    pub staged_key: Option<&'a Path>,
    /// Remote port leased for a reverse tunnel, if any
    pub tunnel_port: Option<u16>,
    /// Shared settings
    pub settings: &'a ToolSettings,
}

impl<'a> BuildContext<'a> {
    /// Context with only the job and scratch directory set
    #[must_use]
    pub fn new(job: &'a Job, scratch_dir: &'a Path, settings: &'a ToolSettings) -> Self {
        Self {
            job,
            policy: None,
            client: None,
            hypervisor: None,
            repository: None,
            scratch_dir,
            staged_key: None,
            tunnel_port: None,
            settings,
        }
    }

    /// The policy, or an error naming it
    ///
    /// # Errors
    ///
    /// Returns error if no policy was loaded
    pub fn require_policy(&self) -> Result<&'a Policy, BuildError> {
        self.policy.ok_or(BuildError::MissingConfig {
            job: self.job.id,
            what: "policy",
        })
    }

    /// The client, or an error naming it
    ///
    /// # Errors
    ///
    /// Returns error if no client was loaded
    pub fn require_client(&self) -> Result<&'a Client, BuildError> {
        self.client.ok_or(BuildError::MissingConfig {
            job: self.job.id,
            what: "client",
        })
    }

    /// The repository, or an error naming it
    ///
    /// # Errors
    ///
    /// Returns error if no repository was loaded
    pub fn require_repository(&self) -> Result<&'a Repository, BuildError> {
        self.repository.ok_or(BuildError::MissingConfig {
            job: self.job.id,
            what: "repository",
        })
    }

    /// Host the remote shell runs on
    ///
    /// VM backups run on the hypervisor, everything else on the client.
    ///
    /// # Errors
    ///
    /// Returns error if the host was not loaded
    pub fn remote_host(&self) -> Result<&'a Client, BuildError> {
        let is_vm = self.policy.map(|p| p.policy_type) == Some(PolicyType::Vm);
        if is_vm && self.job.prepare.is_none() {
            return self.hypervisor.ok_or(BuildError::MissingConfig {
                job: self.job.id,
                what: "hypervisor",
            });
        }
        self.require_client()
    }

    /// Repository passphrase, if configured
    #[must_use]
    pub fn repository_passphrase(&self) -> Option<&'a Secret> {
        self.repository
            .and_then(|r| r.credentials.repository_passphrase.as_ref())
            .filter(|s| !s.is_empty())
    }

    /// Scratch file path as a string
    #[must_use]
    pub fn scratch_path(&self, name: &str) -> String {
        self.scratch_dir.join(name).display().to_string()
    }
}
