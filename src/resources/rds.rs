//! PostgreSQL database instance on RDS.
//!
//! Parameters that carry the master password are passed with
//! `--cli-input-json file:///dev/stdin` from a heredoc, so the password
//! never appears in a process argument list.

use super::{
    aws_preamble, base_spec, bool_attr, guarded_read, heredoc, int_attr, resource_name, str_attr,
    tags_json,
};
use crate::core::codegen::quote;
use crate::core::error::ConfigError;
use crate::core::types::{AttrValue, RecordedOutputs, ResourceKind, ResourceLock, ResourceSpec};
use crate::core::variables::Context;

pub const ID: &str = "database";
pub const MASTER_USERNAME: &str = "postgres";

const OUTPUT_QUERY: &str = "DBInstances[0].{id: DBInstanceIdentifier, arn: DBInstanceArn, \
address: Endpoint.Address, port: Endpoint.Port, status: DBInstanceStatus, engine_version: EngineVersion}";
const NOT_FOUND: &[&str] = &["DBInstanceNotFound"];

pub fn spec(ctx: &Context) -> Result<ResourceSpec, ConfigError> {
    Ok(
        base_spec(ctx, ID, ResourceKind::DatabaseInstance, resource_name(ctx, "postgres")?)?
            .attr("engine", "postgres")
            .attr("engine_version", ctx.string("db_engine_version")?)
            .attr("instance_class", ctx.string("db_instance_class")?)
            .attr("allocated_storage", ctx.int("db_allocated_storage")?)
            .attr("port", super::security::POSTGRES_PORT)
            .attr("master_username", MASTER_USERNAME)
            .attr("master_password", ctx.secret("db_password")?.clone())
            .attr("security_group_id", AttrValue::reference(super::security::ID, "id"))
            .attr("publicly_accessible", ctx.bool("db_publicly_accessible")?)
            .attr("backup_retention_days", ctx.int("db_backup_retention_days")?)
            .attr("deletion_protection", ctx.bool("db_deletion_protection")?),
    )
}

/// Fields shared by create and modify requests.
fn common_input(spec: &ResourceSpec) -> serde_json::Map<String, serde_json::Value> {
    let mut input = serde_json::Map::new();
    input.insert("DBInstanceIdentifier".into(), spec.name.clone().into());
    input.insert("DBInstanceClass".into(), str_attr(spec, "instance_class").into());
    input.insert("AllocatedStorage".into(), int_attr(spec, "allocated_storage").into());
    input.insert(
        "VpcSecurityGroupIds".into(),
        serde_json::json!([str_attr(spec, "security_group_id")]),
    );
    input.insert("PubliclyAccessible".into(), bool_attr(spec, "publicly_accessible").into());
    input.insert(
        "BackupRetentionPeriod".into(),
        int_attr(spec, "backup_retention_days").into(),
    );
    input.insert("DeletionProtection".into(), bool_attr(spec, "deletion_protection").into());
    if let Some(secret) = spec.get("master_password").and_then(AttrValue::as_secret) {
        secret.expose(|pw| input.insert("MasterUserPassword".into(), pw.into()));
    }
    input
}

fn describe(name: &str) -> String {
    format!(
        "aws rds describe-db-instances --db-instance-identifier {} --query {} --output json\n",
        quote(name),
        quote(OUTPUT_QUERY)
    )
}

pub fn read_script(spec: &ResourceSpec) -> String {
    let cmd = format!(
        "aws rds describe-db-instances --db-instance-identifier {} --query {} --output json",
        quote(&spec.name),
        quote(OUTPUT_QUERY)
    );
    aws_preamble(str_attr(spec, "region")) + &guarded_read(&cmd, NOT_FOUND)
}

/// Create, wait until `available`, print the endpoint.
pub fn create_script(spec: &ResourceSpec) -> String {
    let mut input = common_input(spec);
    input.insert("Engine".into(), str_attr(spec, "engine").into());
    input.insert("EngineVersion".into(), str_attr(spec, "engine_version").into());
    input.insert("MasterUsername".into(), str_attr(spec, "master_username").into());
    input.insert("Port".into(), int_attr(spec, "port").into());
    input.insert("StorageType".into(), "gp3".into());
    input.insert("StorageEncrypted".into(), true.into());
    input.insert("CopyTagsToSnapshot".into(), true.into());
    input.insert("Tags".into(), tags_json(spec));
    let json = serde_json::Value::Object(input).to_string();

    format!(
        "{preamble}aws rds create-db-instance --cli-input-json file:///dev/stdin --query 'DBInstance.DBInstanceStatus' --output text >/dev/null {doc}\
         aws rds wait db-instance-available --db-instance-identifier {name}\n\
         {describe}",
        preamble = aws_preamble(str_attr(spec, "region")),
        doc = heredoc("STRATUM_JSON", &json),
        name = quote(&spec.name),
        describe = describe(&spec.name),
    )
}

/// Modify in place, applied immediately. The engine version is only sent
/// when the running version does not already satisfy the desired one.
pub fn update_script(spec: &ResourceSpec, prior: &RecordedOutputs) -> String {
    let mut input = common_input(spec);
    input.insert("ApplyImmediately".into(), true.into());
    let desired = str_attr(spec, "engine_version");
    let running = prior.get("engine_version").map(String::as_str).unwrap_or_default();
    if !running.is_empty() && running != desired && !running.starts_with(&format!("{}.", desired)) {
        input.insert("EngineVersion".into(), desired.into());
        input.insert("AllowMajorVersionUpgrade".into(), true.into());
    }
    let json = serde_json::Value::Object(input).to_string();

    format!(
        "{preamble}aws rds modify-db-instance --cli-input-json file:///dev/stdin --query 'DBInstance.DBInstanceStatus' --output text >/dev/null {doc}\
         sleep 5\n\
         aws rds wait db-instance-available --db-instance-identifier {name}\n\
         {describe}",
        preamble = aws_preamble(str_attr(spec, "region")),
        doc = heredoc("STRATUM_JSON", &json),
        name = quote(&spec.name),
        describe = describe(&spec.name),
    )
}

/// Delete without a final snapshot and wait until gone. Deletion protection
/// is left to the API to enforce.
pub fn delete_script(lock: &ResourceLock) -> String {
    let region = lock.details.get("region").map(String::as_str).unwrap_or_default();
    format!(
        "{preamble}if ! out=$(aws rds delete-db-instance --db-instance-identifier {name} --skip-final-snapshot --delete-automated-backups 2>&1); then\n\
         \x20 case \"$out\" in\n\
         \x20   *DBInstanceNotFound*) exit 0 ;;\n\
         \x20 esac\n\
         \x20 printf '%s\\n' \"$out\" >&2\n\
         \x20 exit 1\n\
         fi\n\
         aws rds wait db-instance-deleted --db-instance-identifier {name}\n",
        preamble = aws_preamble(region),
        name = quote(&lock.name),
    )
}
