//! Resource modules: one per piece of the stack.
//!
//! Each module provides:
//! 1. `spec`, building the desired [`ResourceSpec`] from resolved variables
//! 2. `read_script`, printing the remote object as JSON (or nothing if absent)
//! 3. `create_script` / `update_script`, converging and printing outputs as JSON
//! 4. `delete_script`, removing the object recorded in state

pub mod iam;
pub mod modal;
pub mod postgres;
pub mod rds;
pub mod s3;
pub mod security;
pub mod stack;

use crate::core::codegen::quote;
use crate::core::error::ConfigError;
use crate::core::types::{AttrValue, ResourceKind, ResourceSpec};
use crate::core::variables::Context;

/// `{project}-{environment}-{suffix}`
pub(crate) fn resource_name(ctx: &Context, suffix: &str) -> Result<String, ConfigError> {
    Ok(format!(
        "{}-{}-{}",
        ctx.string("project")?,
        ctx.string("environment")?,
        suffix
    ))
}

/// A spec carrying the attributes every AWS resource shares.
pub(crate) fn base_spec(
    ctx: &Context,
    id: &str,
    kind: ResourceKind,
    name: impl Into<String>,
) -> Result<ResourceSpec, ConfigError> {
    Ok(ResourceSpec::new(id, kind, name)
        .attr("region", ctx.string("region")?)
        .attr("project", ctx.string("project")?)
        .attr("environment", ctx.string("environment")?))
}

pub(crate) fn str_attr<'a>(spec: &'a ResourceSpec, key: &str) -> &'a str {
    spec.get(key).and_then(AttrValue::as_str).unwrap_or_default()
}

pub(crate) fn bool_attr(spec: &ResourceSpec, key: &str) -> bool {
    spec.get(key).and_then(AttrValue::as_bool).unwrap_or(false)
}

pub(crate) fn int_attr(spec: &ResourceSpec, key: &str) -> i64 {
    spec.get(key).and_then(AttrValue::as_int).unwrap_or_default()
}

pub(crate) fn list_attr<'a>(spec: &'a ResourceSpec, key: &str) -> &'a [String] {
    spec.get(key).and_then(AttrValue::as_list).unwrap_or_default()
}

/// Common script header for AWS CLI scripts.
pub(crate) fn aws_preamble(region: &str) -> String {
    format!(
        "set -euo pipefail\nexport AWS_REGION={}\nexport AWS_PAGER=''\n",
        quote(region)
    )
}

/// Run a describe command; print its output, or nothing when the error text
/// contains one of the not-found markers.
pub(crate) fn guarded_read(cmd: &str, not_found: &[&str]) -> String {
    guarded(cmd, not_found, "printf '%s\\n' \"$out\"")
}

/// Like [`guarded_read`], but run `on_success` instead of echoing the output.
pub(crate) fn guarded(cmd: &str, not_found: &[&str], on_success: &str) -> String {
    let patterns = not_found
        .iter()
        .map(|m| format!("*{}*", quote(m)))
        .collect::<Vec<_>>()
        .join("|");
    format!(
        "if ! out=$({cmd} 2>&1); then\n\
         \x20 case \"$out\" in\n\
         \x20   {patterns}) exit 0 ;;\n\
         \x20 esac\n\
         \x20 printf '%s\\n' \"$out\" >&2\n\
         \x20 exit 1\n\
         fi\n\
         {on_success}\n"
    )
}

/// Standard tags as `Key=..,Value=..` pairs.
pub(crate) fn tag_pairs(spec: &ResourceSpec) -> Vec<(String, String)> {
    vec![
        ("Project".to_string(), str_attr(spec, "project").to_string()),
        ("Environment".to_string(), str_attr(spec, "environment").to_string()),
        ("ManagedBy".to_string(), "stratum".to_string()),
    ]
}

/// Tags as an AWS JSON tag list.
pub(crate) fn tags_json(spec: &ResourceSpec) -> serde_json::Value {
    serde_json::Value::Array(
        tag_pairs(spec)
            .into_iter()
            .map(|(k, v)| serde_json::json!({ "Key": k, "Value": v }))
            .collect(),
    )
}

/// Heredoc feeding `body` to stdin of the preceding command.
pub(crate) fn heredoc(delimiter: &str, body: &str) -> String {
    format!("<<'{delimiter}'\n{body}\n{delimiter}\n")
}

/// Resolved variables with the required values filled in.
#[cfg(test)]
pub(crate) fn test_context() -> Context {
    use crate::core::variables::{resolve, CATALOG};
    let cli = indexmap::IndexMap::from([
        ("db_password".to_string(), "correct-horse-battery".to_string()),
        ("bucket_name".to_string(), "agd-dev-tyson".to_string()),
        ("allowed_db_cidr_blocks".to_string(), "10.0.0.0/16,192.168.1.0/24".to_string()),
    ]);
    resolve(CATALOG, &indexmap::IndexMap::new(), &cli).unwrap()
}
