//! Security group guarding the database port.

use super::{aws_preamble, base_spec, int_attr, list_attr, resource_name, str_attr};
use crate::core::codegen::quote;
use crate::core::error::ConfigError;
use crate::core::types::{RecordedOutputs, ResourceKind, ResourceLock, ResourceSpec};
use crate::core::variables::Context;

pub const ID: &str = "db-security-group";
pub const POSTGRES_PORT: i64 = 5432;

/// Ingress on the PostgreSQL port from the allowed CIDR blocks.
pub fn spec(ctx: &Context) -> Result<ResourceSpec, ConfigError> {
    let name = resource_name(ctx, "postgres-sg")?;
    Ok(base_spec(ctx, ID, ResourceKind::SecurityGroup, name.clone())?
        .attr("description", format!("PostgreSQL access for {}", name))
        .attr("vpc_id", ctx.string("vpc_id")?)
        .attr("port", POSTGRES_PORT)
        .attr("cidr_blocks", ctx.list("allowed_db_cidr_blocks")?.to_vec()))
}

fn ip_permissions(spec: &ResourceSpec) -> String {
    let port = int_attr(spec, "port");
    let ranges: Vec<serde_json::Value> = list_attr(spec, "cidr_blocks")
        .iter()
        .map(|cidr| serde_json::json!({ "CidrIp": cidr, "Description": "stratum" }))
        .collect();
    serde_json::json!([{
        "IpProtocol": "tcp",
        "FromPort": port,
        "ToPort": port,
        "IpRanges": ranges,
    }])
    .to_string()
}

const OUTPUT_QUERY: &str = "SecurityGroups[0].{id: GroupId, vpc_id: VpcId}";

fn vpc_lookup(spec: &ResourceSpec) -> String {
    format!(
        "vpc={}\n\
         if [ -z \"$vpc\" ]; then\n\
         \x20 vpc=$(aws ec2 describe-vpcs --filters Name=isDefault,Values=true --query 'Vpcs[0].VpcId' --output text)\n\
         fi\n",
        quote(str_attr(spec, "vpc_id"))
    )
}

/// Print `{id, vpc_id}` of the group with this name, or `null`.
pub fn read_script(spec: &ResourceSpec) -> String {
    let mut script = aws_preamble(str_attr(spec, "region"));
    script.push_str(&vpc_lookup(spec));
    script.push_str(&format!(
        "aws ec2 describe-security-groups --filters Name=group-name,Values={} \"Name=vpc-id,Values=$vpc\" --query {} --output json\n",
        quote(&spec.name),
        quote(OUTPUT_QUERY)
    ));
    script
}

pub fn create_script(spec: &ResourceSpec) -> String {
    let tags: Vec<String> = super::tag_pairs(spec)
        .iter()
        .map(|(k, v)| format!("{{Key={},Value={}}}", k, v))
        .collect();
    let mut script = aws_preamble(str_attr(spec, "region"));
    script.push_str(&vpc_lookup(spec));
    script.push_str(&format!(
        "gid=$(aws ec2 create-security-group --group-name {name} --description {desc} --vpc-id \"$vpc\" \
         --tag-specifications {tags} --query GroupId --output text)\n\
         aws ec2 authorize-security-group-ingress --group-id \"$gid\" --ip-permissions {perms} >/dev/null\n\
         aws ec2 describe-security-groups --group-ids \"$gid\" --query {query} --output json\n",
        name = quote(&spec.name),
        desc = quote(str_attr(spec, "description")),
        tags = quote(&format!("ResourceType=security-group,Tags=[{}]", tags.join(","))),
        perms = quote(&ip_permissions(spec)),
        query = quote(OUTPUT_QUERY),
    ));
    script
}

/// Replace all ingress rules with the desired ones.
pub fn update_script(spec: &ResourceSpec, prior: &RecordedOutputs) -> String {
    let gid = prior.get("id").map(String::as_str).unwrap_or_default();
    let mut script = aws_preamble(str_attr(spec, "region"));
    script.push_str(&format!(
        "gid={gid}\n\
         current=$(aws ec2 describe-security-groups --group-ids \"$gid\" --query 'SecurityGroups[0].IpPermissions' --output json)\n\
         if [ \"$current\" != \"[]\" ]; then\n\
         \x20 aws ec2 revoke-security-group-ingress --group-id \"$gid\" --ip-permissions \"$current\" >/dev/null\n\
         fi\n\
         aws ec2 authorize-security-group-ingress --group-id \"$gid\" --ip-permissions {perms} >/dev/null\n\
         aws ec2 describe-security-groups --group-ids \"$gid\" --query {query} --output json\n",
        gid = quote(gid),
        perms = quote(&ip_permissions(spec)),
        query = quote(OUTPUT_QUERY),
    ));
    script
}

/// Delete the group. Network interfaces of a just-deleted instance can hold
/// it for a while, so dependency violations are retried.
pub fn delete_script(lock: &ResourceLock) -> String {
    let gid = lock.outputs.get("id").map(String::as_str).unwrap_or_default();
    let region = lock.details.get("region").map(String::as_str).unwrap_or_default();
    let mut script = aws_preamble(region);
    script.push_str(&format!(
        "gid={gid}\n\
         for attempt in 1 2 3 4 5 6 7 8 9 10; do\n\
         \x20 if out=$(aws ec2 delete-security-group --group-id \"$gid\" 2>&1); then exit 0; fi\n\
         \x20 case \"$out\" in\n\
         \x20   *InvalidGroup.NotFound*) exit 0 ;;\n\
         \x20   *DependencyViolation*) sleep 15 ;;\n\
         \x20   *) printf '%s\\n' \"$out\" >&2; exit 1 ;;\n\
         \x20 esac\n\
         done\n\
         printf '%s\\n' \"$out\" >&2\n\
         exit 1\n",
        gid = quote(gid),
    ));
    script
}
