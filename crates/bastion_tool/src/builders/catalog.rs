//! Catalog jobs.
//!
//! The archive listing is produced on the host that created the archive,
//! packed as `base64(gzip(json array))` and posted back as a queue payload
//! `{"job_id": .., "catalog": ..}`.

use super::require_archive;
use crate::builder::CommandBuilder;
use crate::command::CommandLine;
use crate::context::BuildContext;
use crate::env;
use crate::error::BuildError;
use crate::remote::{ENV_FILE, RemoteBootstrap, SCRIPT_FILE};
use crate::shell;
use bastion_core::JobType;

/// Path the catalog payload is posted to, relative to the base URL
pub const CATALOG_ENDPOINT: &str = "/api/v1/events/";

const BLOB_FILE: &str = "catalog.b64";

/// Builds `catalog` jobs
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogBuilder;

impl CommandBuilder for CatalogBuilder {
    fn job_type(&self) -> JobType {
        JobType::Catalog
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CommandLine, BuildError> {
        if ctx.settings.base_url.is_none() {
            return Err(BuildError::MissingConfig {
                job: ctx.job.id,
                what: "callback base URL",
            });
        }
        if ctx.settings.token.as_ref().is_none_or(|t| t.is_empty()) {
            return Err(BuildError::MissingSecret {
                job: ctx.job.id,
                what: "callback token",
            });
        }
        let host = ctx.remote_host()?;
        let archive = require_archive(ctx)?;
        let list = shell::join(&[
            ctx.settings.borg.clone(),
            "list".to_string(),
            "--json-lines".to_string(),
            format!("::{}", archive),
        ]);

        RemoteBootstrap::new(*ctx, host)
            .with_env(env::repository_env(ctx, false)?)
            .line(format!("trap 'rm -f {} {} {}' EXIT", ENV_FILE, SCRIPT_FILE, BLOB_FILE))
            .line(format!(
                "{{ printf '['; {} | sed '$!s/$/,/'; printf ']'; }} | gzip -c | base64 | tr -d '\\n' > {}",
                list, BLOB_FILE
            ))
            .line(format!(
                "printf '{{\"job_id\": %s, \"catalog\": \"%s\"}}' \"$BASTION_JOB_ID\" \"$(cat {})\" \\\n  | curl -fsS -X POST -H \"Authorization: Bearer $BASTION_TOKEN\" -H 'Content-Type: application/json' --data-binary @- \"$BASTION_URL{}\"",
                BLOB_FILE, CATALOG_ENDPOINT
            ))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::World;
    use bastion_core::Secret;

    fn configured() -> World {
        let mut world = World::new(JobType::Catalog);
        world.settings.base_url = Some("https://bastion.example/".into());
        world.settings.token = Some(Secret::new("tok-123"));
        world
    }

    #[test]
    fn test_catalog_posts_listing() {
        let world = configured();
        let cmd = CatalogBuilder.build(&world.ctx()).unwrap();
        let script = cmd.files.iter().find(|f| f.name == SCRIPT_FILE).unwrap();
        let body = script.contents.expose();
        assert!(body.contains("borg list --json-lines ::web1-42-2026-10-18T02:00:00"));
        assert!(body.contains("gzip -c | base64"));
        assert!(body.contains("\"$BASTION_URL/api/v1/events/\""));
        assert!(!body.contains("tok-123"));

        let env_file = cmd.files.iter().find(|f| f.name == ENV_FILE).unwrap();
        assert!(env_file.contents.expose().contains("BASTION_TOKEN=tok-123"));
        assert_eq!(env_file.mode, 0o600);
    }

    #[test]
    fn test_catalog_needs_callback() {
        let mut world = configured();
        world.settings.base_url = None;
        assert!(matches!(
            CatalogBuilder.build(&world.ctx()),
            Err(BuildError::MissingConfig { .. })
        ));

        let mut world = configured();
        world.settings.token = None;
        assert!(matches!(
            CatalogBuilder.build(&world.ctx()),
            Err(BuildError::MissingSecret { .. })
        ));
    }
}
