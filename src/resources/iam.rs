//! IAM policy, user and access key scoped to the bucket.
//!
//! Access keys are special: the secret half is returned only by the create
//! call and is never recorded, so an "update" of a key is a rotation.

use super::{aws_preamble, base_spec, guarded_read, resource_name, str_attr, tag_pairs};
use crate::core::codegen::quote;
use crate::core::error::ConfigError;
use crate::core::policy::PolicyDocument;
use crate::core::types::{AttrValue, RecordedOutputs, ResourceKind, ResourceLock, ResourceSpec};
use crate::core::variables::Context;

pub const POLICY_ID: &str = "bucket-policy";
pub const USER_ID: &str = "modal-user";
pub const KEY_ID: &str = "modal-access-key";

const POLICY_QUERY: &str = "Policy.{arn: Arn, name: PolicyName, default_version: DefaultVersionId}";
const USER_QUERY: &str = "User.{name: UserName, arn: Arn}";
const NO_SUCH_ENTITY: &[&str] = &["NoSuchEntity"];

fn lock_region(lock: &ResourceLock) -> &str {
    lock.details.get("region").map(String::as_str).unwrap_or_default()
}

fn cli_tags(spec: &ResourceSpec) -> String {
    tag_pairs(spec)
        .iter()
        .map(|(k, v)| format!("Key={},Value={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Policy
// ============================================================================

pub fn policy_spec(ctx: &Context) -> Result<ResourceSpec, ConfigError> {
    let doc = PolicyDocument::bucket_access(ctx.string("bucket_name")?);
    Ok(
        base_spec(ctx, POLICY_ID, ResourceKind::IamPolicy, resource_name(ctx, "bucket-access")?)?
            .attr("description", "Read/write access to the pipeline bucket")
            .attr("document", doc.to_json())
            .after(super::s3::ID),
    )
}

fn account_policy_arn(name: &str) -> String {
    format!(
        "acct=$(aws sts get-caller-identity --query Account --output text)\n\
         arn=\"arn:aws:iam::${{acct}}:policy/\"{}\n",
        quote(name)
    )
}

pub fn policy_read_script(spec: &ResourceSpec) -> String {
    let mut script = aws_preamble(str_attr(spec, "region"));
    script.push_str(&account_policy_arn(&spec.name));
    script.push_str(&guarded_read(
        &format!("aws iam get-policy --policy-arn \"$arn\" --query {} --output json", quote(POLICY_QUERY)),
        NO_SUCH_ENTITY,
    ));
    script
}

pub fn policy_create_script(spec: &ResourceSpec) -> String {
    format!(
        "{preamble}aws iam create-policy --policy-name {name} --description {desc} \
         --policy-document {doc} --tags {tags} --query {query} --output json\n",
        preamble = aws_preamble(str_attr(spec, "region")),
        name = quote(&spec.name),
        desc = quote(str_attr(spec, "description")),
        doc = quote(str_attr(spec, "document")),
        tags = cli_tags(spec),
        query = quote(POLICY_QUERY),
    )
}

fn prune_versions() -> &'static str {
    "for v in $(aws iam list-policy-versions --policy-arn \"$arn\" \
     --query 'Versions[?!IsDefaultVersion].VersionId' --output text); do\n\
     \x20 aws iam delete-policy-version --policy-arn \"$arn\" --version-id \"$v\"\n\
     done\n"
}

/// Publish a new default version. Older versions are pruned first so the
/// five-version limit is never hit.
pub fn policy_update_script(spec: &ResourceSpec, prior: &RecordedOutputs) -> String {
    let mut script = aws_preamble(str_attr(spec, "region"));
    match prior.get("arn") {
        Some(arn) => script.push_str(&format!("arn={}\n", quote(arn))),
        None => script.push_str(&account_policy_arn(&spec.name)),
    }
    script.push_str(prune_versions());
    script.push_str(&format!(
        "aws iam create-policy-version --policy-arn \"$arn\" --policy-document {} --set-as-default >/dev/null\n\
         aws iam get-policy --policy-arn \"$arn\" --query {} --output json\n",
        quote(str_attr(spec, "document")),
        quote(POLICY_QUERY)
    ));
    script
}

pub fn policy_delete_script(lock: &ResourceLock) -> String {
    let arn = lock.outputs.get("arn").map(String::as_str).unwrap_or_default();
    let mut script = aws_preamble(lock_region(lock));
    script.push_str(&format!("arn={}\n", quote(arn)));
    script.push_str(&format!(
        "if ! aws iam get-policy --policy-arn \"$arn\" >/dev/null 2>&1; then exit 0; fi\n\
         for u in $(aws iam list-entities-for-policy --policy-arn \"$arn\" --query 'PolicyUsers[].UserName' --output text); do\n\
         \x20 aws iam detach-user-policy --user-name \"$u\" --policy-arn \"$arn\"\n\
         done\n\
         {prune}\
         aws iam delete-policy --policy-arn \"$arn\"\n",
        prune = prune_versions(),
    ));
    script
}

// ============================================================================
// User
// ============================================================================

pub fn user_spec(ctx: &Context) -> Result<ResourceSpec, ConfigError> {
    Ok(
        base_spec(ctx, USER_ID, ResourceKind::IamUser, resource_name(ctx, "modal")?)?
            .attr("policy_arn", AttrValue::reference(POLICY_ID, "arn")),
    )
}

pub fn user_read_script(spec: &ResourceSpec) -> String {
    let cmd = format!(
        "aws iam get-user --user-name {} --query {} --output json",
        quote(&spec.name),
        quote(USER_QUERY)
    );
    aws_preamble(str_attr(spec, "region")) + &guarded_read(&cmd, NO_SUCH_ENTITY)
}

fn attach_only(spec: &ResourceSpec) -> String {
    format!(
        "policy={policy}\n\
         for p in $(aws iam list-attached-user-policies --user-name {user} --query 'AttachedPolicies[].PolicyArn' --output text); do\n\
         \x20 if [ \"$p\" != \"$policy\" ]; then aws iam detach-user-policy --user-name {user} --policy-arn \"$p\"; fi\n\
         done\n\
         aws iam attach-user-policy --user-name {user} --policy-arn \"$policy\"\n",
        policy = quote(str_attr(spec, "policy_arn")),
        user = quote(&spec.name),
    )
}

pub fn user_create_script(spec: &ResourceSpec) -> String {
    format!(
        "{preamble}aws iam create-user --user-name {user} --tags {tags} >/dev/null\n\
         {attach}\
         aws iam get-user --user-name {user} --query {query} --output json\n",
        preamble = aws_preamble(str_attr(spec, "region")),
        user = quote(&spec.name),
        tags = cli_tags(spec),
        attach = attach_only(spec),
        query = quote(USER_QUERY),
    )
}

pub fn user_update_script(spec: &ResourceSpec) -> String {
    format!(
        "{preamble}{attach}\
         aws iam get-user --user-name {user} --query {query} --output json\n",
        preamble = aws_preamble(str_attr(spec, "region")),
        attach = attach_only(spec),
        user = quote(&spec.name),
        query = quote(USER_QUERY),
    )
}

/// Detach policies and delete keys, then the user.
pub fn user_delete_script(lock: &ResourceLock) -> String {
    format!(
        "{preamble}user={user}\n\
         if ! aws iam get-user --user-name \"$user\" >/dev/null 2>&1; then exit 0; fi\n\
         for p in $(aws iam list-attached-user-policies --user-name \"$user\" --query 'AttachedPolicies[].PolicyArn' --output text); do\n\
         \x20 aws iam detach-user-policy --user-name \"$user\" --policy-arn \"$p\"\n\
         done\n\
         {keys}\
         aws iam delete-user --user-name \"$user\"\n",
        preamble = aws_preamble(lock_region(lock)),
        user = quote(&lock.name),
        keys = delete_all_keys(),
    )
}

// ============================================================================
// Access key
// ============================================================================

pub fn key_spec(ctx: &Context) -> Result<ResourceSpec, ConfigError> {
    let user = resource_name(ctx, "modal")?;
    Ok(
        base_spec(ctx, KEY_ID, ResourceKind::IamAccessKey, format!("{}-key", user))?
            .attr("user", AttrValue::reference(USER_ID, "name")),
    )
}

fn delete_all_keys() -> &'static str {
    "for k in $(aws iam list-access-keys --user-name \"$user\" --query 'AccessKeyMetadata[].AccessKeyId' --output text); do\n\
     \x20 aws iam delete-access-key --user-name \"$user\" --access-key-id \"$k\"\n\
     done\n"
}

fn create_key() -> &'static str {
    "aws iam create-access-key --user-name \"$user\" \
     --query 'AccessKey.{access_key_id: AccessKeyId, secret_access_key: SecretAccessKey, user: UserName}' --output json\n"
}

pub fn key_read_script(spec: &ResourceSpec) -> String {
    let cmd = format!(
        "aws iam list-access-keys --user-name {} --query 'AccessKeyMetadata[0].{{access_key_id: AccessKeyId, user: UserName}}' --output json",
        quote(str_attr(spec, "user"))
    );
    aws_preamble(str_attr(spec, "region")) + &guarded_read(&cmd, NO_SUCH_ENTITY)
}

pub fn key_create_script(spec: &ResourceSpec) -> String {
    format!(
        "{}user={}\n{}",
        aws_preamble(str_attr(spec, "region")),
        quote(str_attr(spec, "user")),
        create_key()
    )
}

/// Delete every key of the user, then mint a new one.
pub fn key_rotate_script(spec: &ResourceSpec) -> String {
    format!(
        "{}user={}\n{}{}",
        aws_preamble(str_attr(spec, "region")),
        quote(str_attr(spec, "user")),
        delete_all_keys(),
        create_key()
    )
}

pub fn key_delete_script(lock: &ResourceLock) -> String {
    let user = lock.outputs.get("user").map(String::as_str).unwrap_or_default();
    let key = lock
        .outputs
        .get("access_key_id")
        .map(String::as_str)
        .unwrap_or_default();
    let cmd = format!(
        "aws iam delete-access-key --user-name {} --access-key-id {}",
        quote(user),
        quote(key)
    );
    aws_preamble(lock_region(lock)) + &guarded_read(&cmd, NO_SUCH_ENTITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ResourceStatus;
    use crate::resources::test_context;

    fn lock(kind: ResourceKind, name: &str, outputs: &[(&str, &str)]) -> ResourceLock {
        ResourceLock {
            kind,
            name: name.into(),
            status: ResourceStatus::Converged,
            applied_at: None,
            duration_seconds: None,
            hash: String::new(),
            depends_on: vec![],
            outputs: outputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            details: RecordedOutputs::from([("region".to_string(), "ca-central-1".to_string())]),
            trigger: None,
        }
    }

    #[test]
    fn test_iam_specs_chain() {
        let ctx = test_context();
        let policy = policy_spec(&ctx).unwrap();
        let user = user_spec(&ctx).unwrap();
        let key = key_spec(&ctx).unwrap();
        assert_eq!(policy.name, "agd-dev-bucket-access");
        assert_eq!(policy.dependencies(), vec![super::super::s3::ID]);
        assert_eq!(user.name, "agd-dev-modal");
        assert_eq!(user.dependencies(), vec![POLICY_ID]);
        assert_eq!(key.dependencies(), vec![USER_ID]);
    }

    #[test]
    fn test_iam_policy_document_scoped_to_bucket() {
        let policy = policy_spec(&test_context()).unwrap();
        let doc = str_attr(&policy, "document");
        assert!(doc.contains("arn:aws:s3:::agd-dev-tyson/*"));
        let script = policy_create_script(&policy);
        assert!(script.contains("--policy-name 'agd-dev-bucket-access'"));
        assert!(script.contains("Key=ManagedBy,Value=stratum"));
    }

    #[test]
    fn test_iam_policy_update_prunes_before_publishing() {
        let policy = policy_spec(&test_context()).unwrap();
        let prior = RecordedOutputs::from([(
            "arn".to_string(),
            "arn:aws:iam::123:policy/agd-dev-bucket-access".to_string(),
        )]);
        let script = policy_update_script(&policy, &prior);
        assert!(script.find("delete-policy-version").unwrap() < script.find("create-policy-version").unwrap());
        assert!(script.contains("arn='arn:aws:iam::123:policy/agd-dev-bucket-access'"));
    }

    #[test]
    fn test_iam_user_attaches_resolved_policy() {
        let user = user_spec(&test_context())
            .unwrap()
            .attr("policy_arn", "arn:aws:iam::123:policy/p");
        let script = user_create_script(&user);
        assert!(script.contains("policy='arn:aws:iam::123:policy/p'"));
        assert!(script.contains("attach-user-policy --user-name 'agd-dev-modal'"));
    }

    #[test]
    fn test_iam_user_delete_cleans_up_first() {
        let script = user_delete_script(&lock(ResourceKind::IamUser, "agd-dev-modal", &[]));
        let detach = script.find("detach-user-policy").unwrap();
        let keys = script.find("delete-access-key").unwrap();
        let user = script.find("delete-user").unwrap();
        assert!(detach < user && keys < user);
    }

    #[test]
    fn test_iam_key_rotation_deletes_then_creates() {
        let key = key_spec(&test_context()).unwrap().attr("user", "agd-dev-modal");
        let script = key_rotate_script(&key);
        assert!(script.find("delete-access-key").unwrap() < script.find("create-access-key").unwrap());
        assert!(!key_create_script(&key).contains("delete-access-key"));
    }

    #[test]
    fn test_iam_key_delete_uses_recorded_id() {
        let script = key_delete_script(&lock(
            ResourceKind::IamAccessKey,
            "agd-dev-modal-key",
            &[("access_key_id", "AKIA123"), ("user", "agd-dev-modal")],
        ));
        assert!(script.contains("--access-key-id 'AKIA123'"));
        assert!(script.contains("*'NoSuchEntity'*"));
    }
}
