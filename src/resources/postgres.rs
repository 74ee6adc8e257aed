//! Application role and schema inside the database.
//!
//! Managed with `psql` as the master user over TLS. Passwords travel in
//! heredocs: the admin password into `PGPASSWORD`, the role password inside
//! the SQL fed to stdin.

use super::{base_spec, bool_attr, heredoc, str_attr};
use crate::core::error::ConfigError;
use crate::core::secret::Secret;
use crate::core::types::{AttrValue, ResourceKind, ResourceSpec};
use crate::core::variables::Context;

pub const ID: &str = "db-app-role";
pub const ADMIN_DATABASE: &str = "postgres";

/// Chart categories of the `samples` table.
pub const CHART_TYPES: &[&str] = &[
    "THREE_D", "AREA", "BAR", "BOX", "CANDLE", "HEATMAP", "LINE", "NODE", "OTHER", "PIE", "RADAR",
    "SCATTER", "TREEMAP",
];

/// Per-connection timeout handed to libpq.
const CONNECT_TIMEOUT_SECS: u32 = 10;

/// Password of the application role: `db_app_password`, or the master
/// password when that is empty.
pub(crate) fn role_password(ctx: &Context) -> Result<Secret, ConfigError> {
    let app = ctx.secret("db_app_password")?;
    if app.expose(str::is_empty) {
        Ok(ctx.secret("db_password")?.rekeyed("db_app_password"))
    } else {
        Ok(app.clone())
    }
}

pub fn spec(ctx: &Context) -> Result<ResourceSpec, ConfigError> {
    let admin = ctx.secret("db_password")?;
    let role_password = role_password(ctx)?;
    let role = ctx.string("db_app_user")?;
    Ok(base_spec(ctx, ID, ResourceKind::DatabaseRole, role)?
        .attr("host", AttrValue::reference(super::rds::ID, "address"))
        .attr("port", AttrValue::reference(super::rds::ID, "port"))
        .attr("database", ADMIN_DATABASE)
        .attr("admin_user", super::rds::MASTER_USERNAME)
        .attr("admin_password", admin.clone())
        .attr("role_password", role_password)
        .attr("schema", ctx.string("db_schema")?)
        .attr("bootstrap_tables", ctx.bool("db_bootstrap_tables")?))
}

fn secret_attr<'a>(spec: &'a ResourceSpec, key: &str) -> Option<&'a Secret> {
    spec.get(key).and_then(AttrValue::as_secret)
}

/// SQL string literal.
fn literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// SQL identifier.
fn ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Export `PGPASSWORD` and build the connection string.
fn connect(spec: &ResourceSpec) -> String {
    let password = secret_attr(spec, "admin_password")
        .map(|s| s.expose(str::to_string))
        .unwrap_or_default();
    let conninfo = format!(
        "host={} port={} dbname={} user={} sslmode=require connect_timeout={}",
        str_attr(spec, "host"),
        str_attr(spec, "port"),
        str_attr(spec, "database"),
        str_attr(spec, "admin_user"),
        CONNECT_TIMEOUT_SECS
    );
    format!(
        "set -euo pipefail\n\
         PGPASSWORD=\"$(cat {doc})\"\n\
         export PGPASSWORD\n\
         conn={conninfo}\n",
        doc = heredoc("STRATUM_SECRET", &password).trim_end(),
        conninfo = crate::core::codegen::quote(&conninfo),
    )
}

fn psql(sql: &str) -> String {
    format!(
        "psql \"$conn\" -v ON_ERROR_STOP=1 -q -At {}",
        heredoc("STRATUM_SQL", sql)
    )
}

fn outputs_sql(spec: &ResourceSpec) -> String {
    format!(
        "SELECT json_build_object('role', rolname, 'schema', {}, 'database', current_database()) \
         FROM pg_roles WHERE rolname = {};",
        literal(str_attr(spec, "schema")),
        literal(&spec.name)
    )
}

/// Print the role as JSON, or nothing if it does not exist.
pub fn read_script(spec: &ResourceSpec) -> String {
    connect(spec) + &psql(&outputs_sql(spec))
}

/// `SELECT 1` over a fresh connection.
pub fn probe_script(spec: &ResourceSpec) -> String {
    connect(spec) + &psql("SELECT 1;")
}

/// Idempotent SQL: create or alter the role, own the schema, bootstrap tables.
pub fn apply_sql(spec: &ResourceSpec) -> String {
    let role = ident(&spec.name);
    let schema = ident(str_attr(spec, "schema"));
    let database = ident(str_attr(spec, "database"));
    let password = secret_attr(spec, "role_password")
        .map(|s| s.expose(literal))
        .unwrap_or_else(|| "NULL".to_string());

    let mut sql = format!(
        "DO $$\n\
         BEGIN\n\
         \x20 IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = {name}) THEN\n\
         \x20   CREATE ROLE {role} LOGIN PASSWORD {password};\n\
         \x20 ELSE\n\
         \x20   ALTER ROLE {role} WITH LOGIN PASSWORD {password};\n\
         \x20 END IF;\n\
         END\n\
         $$;\n\
         GRANT CONNECT ON DATABASE {database} TO {role};\n\
         GRANT {role} TO CURRENT_USER;\n\
         CREATE SCHEMA IF NOT EXISTS {schema} AUTHORIZATION {role};\n\
         GRANT USAGE, CREATE ON SCHEMA {schema} TO {role};\n\
         ALTER ROLE {role} SET search_path = {schema}, public;\n",
        name = literal(&spec.name),
    );

    if bool_attr(spec, "bootstrap_tables") {
        let labels = CHART_TYPES
            .iter()
            .map(|t| literal(t))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(
            "SET search_path = {schema};\n\
             DO $$\n\
             BEGIN\n\
             \x20 CREATE TYPE chart_type AS ENUM ({labels});\n\
             EXCEPTION\n\
             \x20 WHEN duplicate_object THEN NULL;\n\
             END\n\
             $$;\n\
             CREATE TABLE IF NOT EXISTS samples (\n\
             \x20 id                SERIAL PRIMARY KEY,\n\
             \x20 source            TEXT NOT NULL,\n\
             \x20 graph_type        chart_type NOT NULL,\n\
             \x20 question          TEXT NOT NULL,\n\
             \x20 good_answer       TEXT NOT NULL,\n\
             \x20 raw_graph         UUID NOT NULL,\n\
             \x20 original_width    INTEGER NOT NULL,\n\
             \x20 original_height   INTEGER NOT NULL,\n\
             \x20 preprocess_meta   JSONB,\n\
             \x20 good_graph        UUID,\n\
             \x20 hidden_graph      UUID,\n\
             \x20 hidden_answer     TEXT,\n\
             \x20 adversarial_graph UUID,\n\
             \x20 output_answer     TEXT,\n\
             \x20 attack_succeeded  BOOLEAN,\n\
             \x20 created_at        TIMESTAMP NOT NULL DEFAULT NOW()\n\
             );\n\
             ALTER TYPE chart_type OWNER TO {role};\n\
             ALTER TABLE samples OWNER TO {role};\n"
        ));
    }

    sql.push_str(&outputs_sql(spec));
    sql
}

pub fn apply_script(spec: &ResourceSpec) -> String {
    connect(spec) + &psql(&apply_sql(spec))
}
