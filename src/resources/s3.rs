//! S3 bucket for pipeline artifacts.

use super::{aws_preamble, base_spec, bool_attr, guarded, str_attr, tag_pairs};
use crate::core::codegen::quote;
use crate::core::error::ConfigError;
use crate::core::policy::bucket_arn;
use crate::core::types::{ResourceKind, ResourceLock, ResourceSpec};
use crate::core::variables::Context;

pub const ID: &str = "bucket";

pub fn spec(ctx: &Context) -> Result<ResourceSpec, ConfigError> {
    Ok(base_spec(ctx, ID, ResourceKind::Bucket, ctx.string("bucket_name")?)?
        .attr("versioning", ctx.bool("s3_versioning")?)
        .attr("force_destroy", ctx.bool("s3_force_destroy")?)
        .attr("encryption", "AES256")
        .attr("block_public_access", true))
}

fn outputs(spec: &ResourceSpec) -> String {
    serde_json::json!({
        "name": spec.name,
        "arn": bucket_arn(&spec.name),
        "region": str_attr(spec, "region"),
    })
    .to_string()
}

pub fn read_script(spec: &ResourceSpec) -> String {
    let cmd = format!("aws s3api head-bucket --bucket {}", quote(&spec.name));
    let emit = format!("printf '%s\\n' {}", quote(&outputs(spec)));
    aws_preamble(str_attr(spec, "region"))
        + &guarded(&cmd, &["Not Found", "404", "NoSuchBucket"], &emit)
}

/// Settings applied on both create and update.
fn configure(spec: &ResourceSpec, creating: bool) -> String {
    let bucket = quote(&spec.name);
    let mut lines = Vec::new();
    if bool_attr(spec, "block_public_access") {
        lines.push(format!(
            "aws s3api put-public-access-block --bucket {} --public-access-block-configuration \
             BlockPublicAcls=true,IgnorePublicAcls=true,BlockPublicPolicy=true,RestrictPublicBuckets=true",
            bucket
        ));
    }
    // A bucket that never had versioning stays unversioned.
    if bool_attr(spec, "versioning") {
        lines.push(format!(
            "aws s3api put-bucket-versioning --bucket {} --versioning-configuration Status=Enabled",
            bucket
        ));
    } else if !creating {
        lines.push(format!(
            "aws s3api put-bucket-versioning --bucket {} --versioning-configuration Status=Suspended",
            bucket
        ));
    }
    let encryption = serde_json::json!({
        "Rules": [{ "ApplyServerSideEncryptionByDefault": { "SSEAlgorithm": str_attr(spec, "encryption") } }]
    });
    lines.push(format!(
        "aws s3api put-bucket-encryption --bucket {} --server-side-encryption-configuration {}",
        bucket,
        quote(&encryption.to_string())
    ));
    let tags: Vec<String> = tag_pairs(spec)
        .iter()
        .map(|(k, v)| format!("{{Key={},Value={}}}", k, v))
        .collect();
    lines.push(format!(
        "aws s3api put-bucket-tagging --bucket {} --tagging {}",
        bucket,
        quote(&format!("TagSet=[{}]", tags.join(",")))
    ));
    lines.push(format!("printf '%s\\n' {}", quote(&outputs(spec))));
    lines.join("\n") + "\n"
}

pub fn create_script(spec: &ResourceSpec) -> String {
    let region = str_attr(spec, "region");
    let create = if region == "us-east-1" {
        format!("aws s3api create-bucket --bucket {} >/dev/null\n", quote(&spec.name))
    } else {
        format!(
            "aws s3api create-bucket --bucket {} --create-bucket-configuration LocationConstraint={} >/dev/null\n",
            quote(&spec.name),
            quote(region)
        )
    };
    aws_preamble(region) + &create + &configure(spec, true)
}

pub fn update_script(spec: &ResourceSpec) -> String {
    aws_preamble(str_attr(spec, "region")) + &configure(spec, false)
}

/// Delete the bucket. With `force_destroy` recorded, every object version
/// and delete marker is removed first; otherwise a non-empty bucket fails.
pub fn delete_script(lock: &ResourceLock) -> String {
    let region = lock.details.get("region").map(String::as_str).unwrap_or_default();
    let force = lock.details.get("force_destroy").is_some_and(|v| v == "true");
    let bucket = quote(&lock.name);
    let mut script = aws_preamble(region);
    if force {
        script.push_str(&format!(
            "while :; do\n\
             \x20 batch=$(aws s3api list-object-versions --bucket {bucket} --max-items 1000 \
             --query '{{Objects: [Versions, DeleteMarkers][][].{{Key: Key, VersionId: VersionId}}, Quiet: `true`}}' --output json)\n\
             \x20 if ! printf '%s' \"$batch\" | grep -q '\"Key\"'; then break; fi\n\
             \x20 aws s3api delete-objects --bucket {bucket} --delete \"$batch\" >/dev/null\n\
             done\n"
        ));
    }
    script.push_str(&format!(
        "if ! out=$(aws s3api delete-bucket --bucket {bucket} 2>&1); then\n\
         \x20 case \"$out\" in\n\
         \x20   *NoSuchBucket*) exit 0 ;;\n\
         \x20 esac\n\
         \x20 printf '%s\\n' \"$out\" >&2\n\
         \x20 exit 1\n\
         fi\n"
    ));
    script
}
