//! Plan generation: diff desired specs against the state lock.

use super::resolver;
use super::types::*;
use crate::tripwire::hasher;
use std::collections::HashMap;

/// Why a resource is planned for update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    Changed,
    Failed,
    Replace,
    Rename,
    Dependency,
    Rotate,
    Push,
}

/// Lock id under which a replaced object is kept until it is destroyed.
pub fn retired_id(id: &str, name: &str) -> String {
    format!("{}@{}", id, name)
}

/// Generate an execution plan for `specs` against `lock`.
pub fn plan(
    stack: &str,
    environment: &str,
    specs: &[ResourceSpec],
    execution_order: &[String],
    lock: Option<&StateLock>,
    replace: &[String],
) -> ExecutionPlan {
    let by_id: HashMap<&str, &ResourceSpec> = specs.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut actions: HashMap<&str, (PlanAction, Option<Reason>)> = HashMap::new();
    for id in execution_order {
        if let Some(spec) = by_id.get(id.as_str()) {
            actions.insert(id.as_str(), determine_action(spec, lock, replace));
        }
    }

    // Dependents of a replaced object must be pointed at the new one.
    for id in execution_order {
        let Some(spec) = by_id.get(id.as_str()) else {
            continue;
        };
        let replaced = spec.dependencies().iter().any(|dep| {
            actions.get(dep.as_str()).map(|a| a.1) == Some(Some(Reason::Rename))
        });
        if let Some(action) = actions.get_mut(id.as_str()) {
            if replaced && action.0 == PlanAction::NoOp {
                *action = (PlanAction::Update, Some(Reason::Dependency));
            }
        }
    }

    // The secret half of an access key is only returned when the key is
    // minted, so a due push needs a fresh key.
    for spec in specs.iter().filter(|s| s.kind == ResourceKind::ExternalSecret) {
        if actions.get(spec.id.as_str()).map(|a| a.0) == Some(PlanAction::NoOp) {
            continue;
        }
        for dep in spec.dependencies() {
            let mints = by_id.get(dep.as_str()).is_some_and(|d| d.kind.mints_secret());
            if let Some(action) = actions.get_mut(dep.as_str()) {
                if mints && action.0 == PlanAction::NoOp {
                    *action = (PlanAction::Update, Some(Reason::Rotate));
                }
            }
        }
    }

    // A new key must be pushed.
    for spec in specs.iter().filter(|s| s.kind == ResourceKind::ExternalSecret) {
        let minted_changed = spec.dependencies().iter().any(|dep| {
            by_id.get(dep.as_str()).is_some_and(|d| d.kind.mints_secret())
                && actions
                    .get(dep.as_str())
                    .is_some_and(|a| a.0 != PlanAction::NoOp)
        });
        if let Some(action) = actions.get_mut(spec.id.as_str()) {
            if minted_changed && action.0 == PlanAction::NoOp {
                *action = (PlanAction::Update, Some(Reason::Push));
            }
        }
    }

    let mut changes = Vec::new();
    let (mut to_create, mut to_update, mut to_destroy, mut unchanged) = (0u32, 0u32, 0u32, 0u32);

    for id in execution_order {
        let (Some(spec), Some(&(action, reason))) =
            (by_id.get(id.as_str()), actions.get(id.as_str()))
        else {
            continue;
        };
        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::Destroy => to_destroy += 1,
            PlanAction::NoOp => unchanged += 1,
        }
        let description = match (reason, recorded_name(lock, id)) {
            (Some(Reason::Rename), Some(old)) => {
                format!("replace {} {} with {}", spec.kind, old, spec.name)
            }
            _ => describe_action(spec.kind, &spec.name, action, reason),
        };
        changes.push(PlannedChange {
            resource_id: id.clone(),
            kind: spec.kind,
            name: spec.name.clone(),
            action,
            description,
        });
    }

    for id in orphans(lock, &by_id) {
        let Some(entry) = lock.and_then(|l| l.resources.get(&id)) else {
            continue;
        };
        to_destroy += 1;
        changes.push(PlannedChange {
            description: describe_action(entry.kind, &entry.name, PlanAction::Destroy, None),
            resource_id: id,
            kind: entry.kind,
            name: entry.name.clone(),
            action: PlanAction::Destroy,
        });
    }

    // Replaced objects go once their successors exist, dependents first.
    for id in execution_order.iter().rev() {
        if actions.get(id.as_str()).map(|a| a.1) != Some(Some(Reason::Rename)) {
            continue;
        }
        let Some(entry) = lock.and_then(|l| l.resources.get(id)) else {
            continue;
        };
        to_destroy += 1;
        changes.push(PlannedChange {
            resource_id: retired_id(id, &entry.name),
            kind: entry.kind,
            name: entry.name.clone(),
            action: PlanAction::Destroy,
            description: format!("destroy {} {} (replaced)", entry.kind, entry.name),
        });
    }

    ExecutionPlan {
        stack: stack.to_string(),
        environment: environment.to_string(),
        changes,
        execution_order: execution_order.to_vec(),
        to_create,
        to_update,
        to_destroy,
        unchanged,
    }
}

/// Lock entries no longer declared, dependents first.
fn orphans(lock: Option<&StateLock>, declared: &HashMap<&str, &ResourceSpec>) -> Vec<String> {
    let Some(lock) = lock else {
        return Vec::new();
    };
    let nodes: Vec<(String, Vec<String>)> = lock
        .resources
        .iter()
        .filter(|(id, _)| !declared.contains_key(id.as_str()))
        .map(|(id, entry)| (id.clone(), entry.depends_on.clone()))
        .collect();
    let mut order = resolver::order_nodes(&nodes)
        .unwrap_or_else(|_| nodes.iter().map(|(id, _)| id.clone()).collect());
    order.reverse();
    order
}

fn recorded_name<'a>(lock: Option<&'a StateLock>, id: &str) -> Option<&'a str> {
    lock.and_then(|l| l.resources.get(id)).map(|e| e.name.as_str())
}

fn determine_action(
    spec: &ResourceSpec,
    lock: Option<&StateLock>,
    replace: &[String],
) -> (PlanAction, Option<Reason>) {
    let Some(entry) = lock.and_then(|l| l.resources.get(&spec.id)) else {
        return (PlanAction::Create, None);
    };
    // A new remote name is a new object; the recorded one is retired.
    if entry.name != spec.name {
        return (PlanAction::Create, Some(Reason::Rename));
    }
    if replace.iter().any(|r| r == &spec.id) {
        return (PlanAction::Update, Some(Reason::Replace));
    }
    if entry.status != ResourceStatus::Converged {
        return (PlanAction::Update, Some(Reason::Failed));
    }
    if entry.hash != hash_desired_state(spec) {
        return (PlanAction::Update, Some(Reason::Changed));
    }
    (PlanAction::NoOp, None)
}

/// Hash of the declared (unresolved) desired state. References hash as
/// their target, secrets as their fingerprint.
pub fn hash_desired_state(spec: &ResourceSpec) -> String {
    let mut components = vec![spec.kind.to_string(), spec.name.clone()];
    for (key, value) in &spec.attributes {
        components.push(format!("{}={}", key, value.hash_component()));
    }
    let refs: Vec<&str> = components.iter().map(String::as_str).collect();
    hasher::composite_hash(&refs)
}

fn describe_action(
    kind: ResourceKind,
    name: &str,
    action: PlanAction,
    reason: Option<Reason>,
) -> String {
    match (action, reason) {
        (PlanAction::Create, _) => format!("create {} {}", kind, name),
        (PlanAction::Update, Some(Reason::Rotate)) => format!("rotate {} {}", kind, name),
        (PlanAction::Update, Some(Reason::Push)) => format!("push {} (access key changed)", name),
        (PlanAction::Update, Some(Reason::Failed)) => {
            format!("update {} {} (previous apply failed)", kind, name)
        }
        (PlanAction::Update, Some(Reason::Replace)) => {
            format!("update {} {} (replace requested)", kind, name)
        }
        (PlanAction::Update, Some(Reason::Dependency)) => {
            format!("update {} {} (dependency replaced)", kind, name)
        }
        (PlanAction::Update, _) => format!("update {} {} (state changed)", kind, name),
        (PlanAction::Destroy, _) => format!("destroy {} {}", kind, name),
        (PlanAction::NoOp, _) => format!("{} {}: no changes", kind, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::secret::Secret;
    use crate::core::state::new_lock;

    fn specs() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("bucket", ResourceKind::Bucket, "agd-dev-tyson").attr("versioning", true),
            ResourceSpec::new("modal-access-key", ResourceKind::IamAccessKey, "agd-dev-modal-key"),
            ResourceSpec::new("modal-secret", ResourceKind::ExternalSecret, "aws")
                .attr(
                    "env.AWS_ACCESS_KEY_ID",
                    AttrValue::reference("modal-access-key", "access_key_id"),
                )
                .after("modal-access-key"),
        ]
    }

    fn order(specs: &[ResourceSpec]) -> Vec<String> {
        specs.iter().map(|s| s.id.clone()).collect()
    }

    fn converged(spec: &ResourceSpec) -> ResourceLock {
        ResourceLock {
            kind: spec.kind,
            name: spec.name.clone(),
            status: ResourceStatus::Converged,
            applied_at: None,
            duration_seconds: None,
            hash: hash_desired_state(spec),
            depends_on: spec.dependencies(),
            outputs: RecordedOutputs::new(),
            details: RecordedOutputs::new(),
            trigger: None,
        }
    }

    fn lock_of(specs: &[ResourceSpec]) -> StateLock {
        let mut lock = new_lock("data-pipeline", "dev", "ca-central-1");
        for s in specs {
            lock.resources.insert(s.id.clone(), converged(s));
        }
        lock
    }

    fn action(plan: &ExecutionPlan, id: &str) -> PlanAction {
        plan.change(id).unwrap().action
    }

    #[test]
    fn test_planner_all_create() {
        let specs = specs();
        let plan = plan("data-pipeline", "dev", &specs, &order(&specs), None, &[]);
        assert_eq!(plan.to_create, 3);
        assert!(plan.has_changes());
        assert_eq!(plan.changes[0].description, "create bucket agd-dev-tyson");
    }

    #[test]
    fn test_planner_all_unchanged() {
        let specs = specs();
        let lock = lock_of(&specs);
        let plan = plan("data-pipeline", "dev", &specs, &order(&specs), Some(&lock), &[]);
        assert_eq!(plan.unchanged, 3);
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_planner_hash_change_updates() {
        let mut specs = specs();
        let lock = lock_of(&specs);
        specs[0] = specs[0].clone().attr("versioning", false);
        let plan = plan("data-pipeline", "dev", &specs, &order(&specs), Some(&lock), &[]);
        assert_eq!(action(&plan, "bucket"), PlanAction::Update);
        assert_eq!(action(&plan, "modal-access-key"), PlanAction::NoOp);
        assert_eq!(action(&plan, "modal-secret"), PlanAction::NoOp);
    }

    #[test]
    fn test_planner_failed_secret_rotates_key() {
        let specs = specs();
        let mut lock = lock_of(&specs);
        lock.resources["modal-secret"].status = ResourceStatus::Failed;
        let plan = plan("data-pipeline", "dev", &specs, &order(&specs), Some(&lock), &[]);
        assert_eq!(action(&plan, "modal-access-key"), PlanAction::Update);
        assert_eq!(action(&plan, "modal-secret"), PlanAction::Update);
        assert!(plan.change("modal-access-key").unwrap().description.starts_with("rotate"));
    }

    #[test]
    fn test_planner_replaced_key_pushes_secret() {
        let specs = specs();
        let lock = lock_of(&specs);
        let replace = vec!["modal-access-key".to_string()];
        let plan = plan("data-pipeline", "dev", &specs, &order(&specs), Some(&lock), &replace);
        assert_eq!(action(&plan, "modal-access-key"), PlanAction::Update);
        assert_eq!(action(&plan, "modal-secret"), PlanAction::Update);
        assert_eq!(action(&plan, "bucket"), PlanAction::NoOp);
        assert_eq!(plan.to_update, 2);
    }

    #[test]
    fn test_planner_orphans_destroyed_in_reverse() {
        let specs = specs();
        let mut lock = lock_of(&specs);
        let parent = ResourceSpec::new("old-user", ResourceKind::IamUser, "agd-dev-old");
        let child = ResourceSpec::new("old-key", ResourceKind::IamAccessKey, "agd-dev-old-key")
            .after("old-user");
        lock.resources.insert("old-user".into(), converged(&parent));
        lock.resources.insert("old-key".into(), converged(&child));

        let plan = plan("data-pipeline", "dev", &specs, &order(&specs), Some(&lock), &[]);
        let destroys: Vec<&str> = plan
            .changes
            .iter()
            .filter(|c| c.action == PlanAction::Destroy)
            .map(|c| c.resource_id.as_str())
            .collect();
        assert_eq!(destroys, ["old-key", "old-user"]);
        assert_eq!(plan.to_destroy, 2);
    }

    #[test]
    fn test_planner_rename_replaces_object() {
        let mut specs = specs();
        specs.push(
            ResourceSpec::new("bucket-policy", ResourceKind::IamPolicy, "agd-dev-bucket-access")
                .attr("bucket", AttrValue::reference("bucket", "name")),
        );
        let lock = lock_of(&specs);
        specs[0].name = "agd-dev-renamed".into();
        let plan = plan("data-pipeline", "dev", &specs, &order(&specs), Some(&lock), &[]);

        let create = plan.change("bucket").unwrap();
        assert_eq!(create.action, PlanAction::Create);
        assert_eq!(
            create.description,
            "replace bucket agd-dev-tyson with agd-dev-renamed"
        );
        assert_eq!(action(&plan, "bucket-policy"), PlanAction::Update);
        assert!(plan
            .change("bucket-policy")
            .unwrap()
            .description
            .ends_with("(dependency replaced)"));

        let retired = plan.changes.last().unwrap();
        assert_eq!(retired.resource_id, "bucket@agd-dev-tyson");
        assert_eq!(retired.action, PlanAction::Destroy);
        assert_eq!(retired.name, "agd-dev-tyson");
        assert_eq!((plan.to_create, plan.to_update, plan.to_destroy), (1, 1, 1));
    }

    #[test]
    fn test_planner_leftover_retired_entry_destroyed() {
        let specs = specs();
        let mut lock = lock_of(&specs);
        let old = ResourceSpec::new("bucket", ResourceKind::Bucket, "agd-dev-old");
        lock.resources.insert(retired_id("bucket", "agd-dev-old"), converged(&old));
        let plan = plan("data-pipeline", "dev", &specs, &order(&specs), Some(&lock), &[]);
        assert_eq!(action(&plan, "bucket@agd-dev-old"), PlanAction::Destroy);
        assert_eq!(action(&plan, "bucket"), PlanAction::NoOp);
    }

    #[test]
    fn test_planner_hash_covers_secret_fingerprint() {
        let a = ResourceSpec::new("database", ResourceKind::DatabaseInstance, "db")
            .attr("master_password", Secret::new("db_password", "one-password"));
        let b = ResourceSpec::new("database", ResourceKind::DatabaseInstance, "db")
            .attr("master_password", Secret::new("db_password", "two-password"));
        assert_ne!(hash_desired_state(&a), hash_desired_state(&b));
        assert_eq!(hash_desired_state(&a), hash_desired_state(&a.clone()));
    }
}
