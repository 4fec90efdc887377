//! Policy expansion.
//!
//! One chain per enabled client: `backup` (new), then `catalog` (waiting)
//! when cataloging is on, then `prune` (waiting) when auto-prune is on and a
//! retention count is set. Chains are templates: ids and `dependent_jobs_id`
//! links are assigned when the chain is persisted.

use bastion_core::{Client, Job, JobId, JobStatus, JobType, LaunchType, Policy, PolicyId};

/// Expansion errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpandError {
    /// Policy is disabled
    #[error("policy {0} is disabled")]
    Disabled(PolicyId),

    /// No enabled client is covered by the policy
    #[error("policy {0} has no enabled clients")]
    NoEnabledClients(PolicyId),
}

/// Jobs for one client, head first
#[derive(Debug, Clone, PartialEq)]
pub struct JobChain {
    jobs: Vec<Job>,
}

impl JobChain {
    /// Jobs in execution order
    #[must_use]
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Consume into jobs in execution order
    #[must_use]
    pub fn into_jobs(self) -> Vec<Job> {
        self.jobs
    }

    /// Chain length
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Check if the chain is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Expand a policy over its clients
///
/// Clients not listed in the policy, and disabled clients, are skipped.
///
/// # Errors
///
/// Returns error if the policy is disabled or covers no enabled client
pub fn expand_policy(
    policy: &Policy,
    clients: &[Client],
    launch_type: LaunchType,
) -> Result<Vec<JobChain>, ExpandError> {
    if !policy.enabled {
        return Err(ExpandError::Disabled(policy.id));
    }

    let with_prune = policy.auto_prune && policy.retention.is_set();
    let chains: Vec<JobChain> = clients
        .iter()
        .filter(|c| c.enabled && policy.client_ids.contains(&c.id))
        .map(|client| {
            let template = |job_type, status| {
                Job::new(JobId::new(0), job_type, launch_type)
                    .with_policy(policy.id)
                    .with_client(client.id)
                    .with_repository(policy.repository_id)
                    .with_status(status)
            };
            let mut jobs = vec![template(JobType::Backup, JobStatus::New)];
            if policy.catalog_enabled {
                jobs.push(template(JobType::Catalog, JobStatus::Waiting));
            }
            if with_prune {
                jobs.push(template(JobType::Prune, JobStatus::Waiting));
            }
            JobChain { jobs }
        })
        .collect();

    if chains.is_empty() {
        return Err(ExpandError::NoEnabledClients(policy.id));
    }
    tracing::debug!(policy_id = %policy.id, chains = chains.len(), "expanded policy");
    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::{BackupMode, ClientId, PolicyType, RepositoryId, Retention};

    fn client(id: u64) -> Client {
        Client {
            id: ClientId::new(id),
            hostname: format!("host{}", id),
            port: 22,
            username: "root".to_string(),
            enabled: true,
            ready: true,
            hypervisor_id: None,
            remote_dir: "/tmp/.bastion".to_string(),
            credentials: Default::default(),
        }
    }

    fn policy() -> Policy {
        Policy {
            id: PolicyId::new(1),
            name: "nightly".to_string(),
            policy_type: PolicyType::Filesystem,
            enabled: true,
            repository_id: RepositoryId::new(1),
            client_ids: vec![ClientId::new(1), ClientId::new(2)],
            retention: Retention {
                keep_daily: Some(7),
                ..Retention::default()
            },
            catalog_enabled: true,
            auto_prune: true,
            mode: BackupMode::Push,
            paths: vec!["/etc".to_string()],
            excludes: Vec::new(),
            compression: "lz4".to_string(),
            dump_command: None,
            timeout_secs: None,
        }
    }

    #[test]
    fn test_two_clients_yield_two_three_long_chains() {
        let chains =
            expand_policy(&policy(), &[client(1), client(2)], LaunchType::Scheduled).unwrap();
        assert_eq!(chains.len(), 2);

        let jobs: Vec<&Job> = chains.iter().flat_map(|c| c.jobs()).collect();
        assert_eq!(jobs.len(), 6);
        assert_eq!(jobs.iter().filter(|j| j.status == JobStatus::New).count(), 2);
        assert_eq!(jobs.iter().filter(|j| j.status == JobStatus::Waiting).count(), 4);

        for chain in &chains {
            let types: Vec<_> = chain.jobs().iter().map(|j| j.job_type).collect();
            assert_eq!(types, vec![JobType::Backup, JobType::Catalog, JobType::Prune]);
        }
    }

    #[test]
    fn test_prune_needs_retention() {
        let mut p = policy();
        p.retention = Retention::default();
        let chains = expand_policy(&p, &[client(1)], LaunchType::Manual).unwrap();
        let types: Vec<_> = chains[0].jobs().iter().map(|j| j.job_type).collect();
        assert_eq!(types, vec![JobType::Backup, JobType::Catalog]);
    }

    #[test]
    fn test_disabled_clients_skipped() {
        let mut disabled = client(2);
        disabled.enabled = false;
        let chains = expand_policy(&policy(), &[client(1), disabled, client(3)], LaunchType::Manual)
            .unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].jobs()[0].client_id, Some(ClientId::new(1)));
    }

    #[test]
    fn test_disabled_policy() {
        let mut p = policy();
        p.enabled = false;
        assert_eq!(
            expand_policy(&p, &[client(1)], LaunchType::Manual),
            Err(ExpandError::Disabled(PolicyId::new(1)))
        );
        assert_eq!(
            expand_policy(&policy(), &[], LaunchType::Manual),
            Err(ExpandError::NoEnabledClients(PolicyId::new(1)))
        );
    }
}
