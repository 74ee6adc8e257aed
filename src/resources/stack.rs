//! The data-pipeline stack: every resource, in declaration order.

use super::{iam, modal, postgres, rds, s3, security};
use crate::core::error::ConfigError;
use crate::core::types::ResourceSpec;
use crate::core::variables::Context;

pub const NAME: &str = "data-pipeline";

/// Desired state of the whole stack. Declaration order breaks ties between
/// independent resources when ordering the apply.
pub fn build(ctx: &Context) -> Result<Vec<ResourceSpec>, ConfigError> {
    Ok(vec![
        security::spec(ctx)?,
        rds::spec(ctx)?,
        s3::spec(ctx)?,
        iam::policy_spec(ctx)?,
        iam::user_spec(ctx)?,
        iam::key_spec(ctx)?,
        postgres::spec(ctx)?,
        modal::spec(ctx)?,
        modal::db_spec(ctx)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::build_execution_order;
    use crate::resources::test_context;

    #[test]
    fn test_stack_order() {
        let specs = build(&test_context()).unwrap();
        let order = build_execution_order(&specs).unwrap();
        assert_eq!(
            order,
            vec![
                security::ID,
                rds::ID,
                s3::ID,
                iam::POLICY_ID,
                iam::USER_ID,
                iam::KEY_ID,
                postgres::ID,
                modal::ID,
                modal::DB_ID,
            ]
        );
    }

    #[test]
    fn test_stack_every_dependency_precedes() {
        let specs = build(&test_context()).unwrap();
        let order = build_execution_order(&specs).unwrap();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        for spec in &specs {
            for dep in spec.dependencies() {
                assert!(pos(&dep) < pos(&spec.id), "{} before {}", dep, spec.id);
            }
        }
    }

    mod lifecycle {
        use super::*;
        use crate::core::error::{ConnectivityError, Error, GraphError, Operation};
        use crate::core::executor::{self, ApplyConfig, DestroyConfig};
        use crate::core::planner;
        use crate::core::retry::Backoff;
        use crate::core::state::{LocalStateStore, StateStore};
        use crate::core::types::{ResourceKind, ResourceStatus};
        use crate::core::variables::{resolve, CATALOG};
        use crate::provider::MemoryProvider;
        use crate::secrets::MemorySecretStore;
        use crate::tripwire::eventlog;
        use indexmap::IndexMap;
        use std::path::Path;
        use std::time::Duration;

        const REGION: &str = "ca-central-1";

        fn context_with(extra: &[(&str, &str)]) -> Context {
            let mut cli = IndexMap::from([
                ("db_password".to_string(), "correct-horse-battery".to_string()),
                ("bucket_name".to_string(), "agd-dev-tyson".to_string()),
                ("allowed_db_cidr_blocks".to_string(), "10.0.0.0/16".to_string()),
            ]);
            for (k, v) in extra {
                cli.insert(k.to_string(), v.to_string());
            }
            resolve(CATALOG, &IndexMap::new(), &cli).unwrap()
        }

        fn config<'a>(
            specs: &'a [ResourceSpec],
            state: &'a LocalStateStore,
            dir: &'a Path,
            replace: &'a [String],
        ) -> ApplyConfig<'a> {
            ApplyConfig {
                stack: NAME,
                environment: "dev",
                region: REGION,
                specs,
                state,
                event_dir: Some(dir),
                dry_run: false,
                replace,
                backoff: Backoff {
                    initial: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    window: Duration::from_millis(5),
                },
            }
        }

        #[test]
        fn test_lifecycle_fresh_apply_then_idempotent() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&test_context()).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();

            let first =
                executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap();
            assert_eq!(first.created, 7);
            assert_eq!(first.secret_pushes, 2);
            assert!(first.warnings.is_empty());
            assert!(
                provider.position(security::ID, Operation::Create)
                    < provider.position(rds::ID, Operation::Create)
            );
            assert!(
                provider.position(rds::ID, Operation::Create)
                    < provider.position(postgres::ID, Operation::Create)
            );
            let key = specs.iter().find(|s| s.id == iam::KEY_ID).unwrap();
            let key_id = provider.object(key.kind, &key.name).unwrap()["access_key_id"].clone();
            assert_eq!(
                secrets.latest("aws", "AWS_ACCESS_KEY_ID").as_deref(),
                Some(key_id.as_str())
            );

            let before = provider.mutation_count();
            let second =
                executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap();
            assert_eq!(second.mutations(), 0);
            assert_eq!(second.unchanged, 9);
            assert_eq!(provider.mutation_count(), before);
            assert_eq!(secrets.pushes().len(), 2);
        }

        #[test]
        fn test_lifecycle_unrelated_change_does_not_push() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&context_with(&[])).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();
            executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                .unwrap();

            let changed = build(&context_with(&[("s3_versioning", "false")])).unwrap();
            let result =
                executor::apply(&config(&changed, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap();
            assert_eq!(result.updated, 1);
            assert_eq!(result.secret_pushes, 0);
            assert_eq!(provider.mutations_of(s3::ID), [Operation::Create, Operation::Update]);
            assert_eq!(secrets.pushes().len(), 2);
        }

        #[test]
        fn test_lifecycle_key_rotation_pushes_once() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&test_context()).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();
            executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                .unwrap();
            let old_key = secrets.latest("aws", "AWS_ACCESS_KEY_ID").unwrap();

            let replace = vec![iam::KEY_ID.to_string()];
            let result = executor::apply(
                &config(&specs, &state, dir.path(), &replace),
                &mut provider,
                &mut secrets,
            )
            .unwrap();
            assert_eq!(result.updated, 1);
            assert_eq!(result.secret_pushes, 1);
            assert_eq!(secrets.pushes().len(), 3);
            assert_ne!(secrets.latest("aws", "AWS_ACCESS_KEY_ID").unwrap(), old_key);
        }

        #[test]
        fn test_lifecycle_failed_push_rotates_on_next_apply() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&test_context()).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();
            secrets.fail_next(1);

            let first =
                executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap();
            assert_eq!(first.warnings.len(), 1);
            let lock = state.load().unwrap().unwrap();
            assert_eq!(lock.resources[modal::ID].status, ResourceStatus::Failed);

            let second =
                executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap();
            assert_eq!(second.secret_pushes, 1);
            assert_eq!(provider.mutations_of(iam::KEY_ID), [Operation::Create, Operation::Update]);
            let lock = state.load().unwrap().unwrap();
            assert_eq!(lock.resources[modal::ID].status, ResourceStatus::Converged);
        }

        #[test]
        fn test_lifecycle_rejection_keeps_earlier_resources() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&test_context()).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();
            provider.fail_on(iam::POLICY_ID, Operation::Create);

            let err =
                executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap_err();
            assert!(matches!(err, Error::Provider(ref e) if e.resource == iam::POLICY_ID));
            assert_eq!(err.exit_code(), 4);

            let lock = state.load().unwrap().unwrap();
            for id in [security::ID, rds::ID, s3::ID] {
                assert_eq!(lock.resources[id].status, ResourceStatus::Converged, "{}", id);
            }
            assert_eq!(lock.resources[iam::POLICY_ID].status, ResourceStatus::Failed);
            assert!(!lock.resources.contains_key(iam::USER_ID));
            assert!(secrets.pushes().is_empty());
        }

        #[test]
        fn test_lifecycle_unreachable_database_is_bounded() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&test_context()).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();
            provider.unreachable_for(usize::MAX);

            let cfg = config(&specs, &state, dir.path(), &[]);
            let err = executor::apply(&cfg, &mut provider, &mut secrets).unwrap_err();
            match &err {
                Error::Connectivity(ConnectivityError::UnreachableDatabase {
                    resource,
                    operation,
                    attempts,
                    ..
                }) => {
                    assert_eq!(resource, postgres::ID);
                    assert_eq!(*operation, Operation::Probe);
                    assert_eq!(*attempts, cfg.backoff.max_attempts());
                }
                other => panic!("unexpected error: {}", other),
            }
            assert_eq!(err.exit_code(), 5);
            assert_eq!(provider.probes(), cfg.backoff.max_attempts() as usize);
            assert!(provider.mutations_of(postgres::ID).is_empty());
        }

        #[test]
        fn test_lifecycle_cycle_aborts_before_mutation() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = vec![
                ResourceSpec::new("a", ResourceKind::Bucket, "agd-a").after("b"),
                ResourceSpec::new("b", ResourceKind::Bucket, "agd-b").after("a"),
            ];
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();

            let err =
                executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap_err();
            assert!(matches!(err, Error::Graph(GraphError::CyclicDependency(_))));
            assert_eq!(provider.mutation_count(), 0);
            assert!(state.load().unwrap().is_none());
        }

        fn pushes_to(secrets: &MemorySecretStore, name: &str) -> usize {
            secrets.pushes().iter().filter(|(n, _)| n == name).count()
        }

        #[test]
        fn test_lifecycle_db_password_change_pushes_db_secret_once() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&context_with(&[])).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();
            executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                .unwrap();

            let changed = build(&context_with(&[("db_password", "staple-battery-horse")])).unwrap();
            let result =
                executor::apply(&config(&changed, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap();
            assert_eq!(result.secret_pushes, 1);
            assert_eq!(pushes_to(&secrets, "aws-rds"), 2);
            assert_eq!(pushes_to(&secrets, "aws"), 1);
            assert_eq!(
                secrets.latest("aws-rds", "DB_PASSWORD").as_deref(),
                Some("staple-battery-horse")
            );
            assert_eq!(provider.mutations_of(rds::ID), [Operation::Create, Operation::Update]);

            let again =
                executor::apply(&config(&changed, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap();
            assert_eq!(again.secret_pushes, 0);
            assert_eq!(pushes_to(&secrets, "aws-rds"), 2);
        }

        #[test]
        fn test_lifecycle_state_and_events_hold_no_secrets() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&test_context()).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();
            executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                .unwrap();

            let minted = secrets.latest("aws", "AWS_SECRET_ACCESS_KEY").unwrap();
            let lock_file = std::fs::read_to_string(state.path()).unwrap();
            let events =
                std::fs::read_to_string(eventlog::event_log_path(dir.path(), "dev")).unwrap();
            assert!(lock_file.contains(iam::KEY_ID));
            assert!(events.contains("secret_pushed"));
            for text in [&lock_file, &events] {
                assert!(!text.contains("correct-horse-battery"));
                assert!(!text.contains(&minted));
            }
        }

        #[test]
        fn test_lifecycle_rename_replaces_bucket() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&context_with(&[])).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();
            executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                .unwrap();

            let renamed = build(&context_with(&[("bucket_name", "agd-dev-renamed")])).unwrap();
            let result =
                executor::apply(&config(&renamed, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap();
            assert_eq!(result.created, 1);
            assert_eq!(result.destroyed, 1);
            assert!(provider.object(ResourceKind::Bucket, "agd-dev-renamed").is_some());
            assert!(provider.object(ResourceKind::Bucket, "agd-dev-tyson").is_none());
            assert_eq!(provider.mutations_of(s3::ID), [Operation::Create, Operation::Create]);
            assert_eq!(
                provider.mutations_of(&planner::retired_id(s3::ID, "agd-dev-tyson")),
                [Operation::Delete]
            );
            assert_eq!(
                provider.mutations_of(iam::POLICY_ID),
                [Operation::Create, Operation::Update]
            );

            let lock = state.load().unwrap().unwrap();
            assert_eq!(lock.resources[s3::ID].name, "agd-dev-renamed");
            assert_eq!(lock.resources[s3::ID].status, ResourceStatus::Converged);
            assert!(lock.resources.keys().all(|id| !id.contains('@')));

            let again =
                executor::apply(&config(&renamed, &state, dir.path(), &[]), &mut provider, &mut secrets)
                    .unwrap();
            assert_eq!(again.mutations(), 0);
        }

        #[test]
        fn test_lifecycle_destroy_reverse_order() {
            let dir = tempfile::tempdir().unwrap();
            let state = LocalStateStore::new(dir.path(), "dev", REGION);
            let specs = build(&test_context()).unwrap();
            let mut provider = MemoryProvider::new();
            let mut secrets = MemorySecretStore::new();
            executor::apply(&config(&specs, &state, dir.path(), &[]), &mut provider, &mut secrets)
                .unwrap();

            let cfg = DestroyConfig {
                stack: NAME,
                environment: "dev",
                region: REGION,
                state: &state,
                event_dir: Some(dir.path()),
            };
            let result = executor::destroy(&cfg, &mut provider, &mut secrets).unwrap();
            let pos = |id: &str| result.destroyed.iter().position(|d| d == id).unwrap();
            assert!(pos(modal::ID) < pos(iam::KEY_ID));
            assert!(pos(modal::DB_ID) < pos(postgres::ID));
            assert_eq!(result.destroyed.last().map(String::as_str), Some(security::ID));
            assert_eq!(result.destroyed.len(), 9);
            let mut deleted = secrets.deleted().to_vec();
            deleted.sort();
            assert_eq!(deleted, ["aws", "aws-rds"]);
            assert!(
                provider.position(iam::KEY_ID, Operation::Delete)
                    < provider.position(iam::USER_ID, Operation::Delete)
            );
            assert!(
                provider.position(rds::ID, Operation::Delete)
                    < provider.position(security::ID, Operation::Delete)
            );
            assert!(state.load().unwrap().unwrap().resources.is_empty());
        }
    }
}
