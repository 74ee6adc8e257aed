//! Layered variable resolution.
//!
//! Every variable the stack understands is declared once in [`CATALOG`].
//! Values come from three layers: command line, environment file, catalog
//! default, in that order of precedence. Sensitive values are wrapped in
//! [`Secret`] as soon as they are parsed.

use super::error::ConfigError;
use super::secret::Secret;
use indexmap::IndexMap;
use regex::Regex;
use serde_yaml_ng::Value;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

/// Declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    String,
    Bool,
    Int,
    List,
    Secret,
}

impl VarType {
    fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::List => "list",
            Self::Secret => "secret",
        }
    }
}

/// One catalog entry. A `None` default makes the variable required.
#[derive(Debug, Clone, Copy)]
pub struct VariableDecl {
    pub name: &'static str,
    pub var_type: VarType,
    pub default: Option<&'static str>,
    pub description: &'static str,
}

const fn decl(
    name: &'static str,
    var_type: VarType,
    default: Option<&'static str>,
    description: &'static str,
) -> VariableDecl {
    VariableDecl {
        name,
        var_type,
        default,
        description,
    }
}

/// Variables of the data-pipeline stack.
pub const CATALOG: &[VariableDecl] = &[
    decl("environment", VarType::String, Some("dev"), "Deployment environment name"),
    decl("region", VarType::String, Some("ca-central-1"), "AWS region"),
    decl("project", VarType::String, Some("agd"), "Prefix for resource names"),
    decl("db_password", VarType::Secret, None, "Master password of the database instance"),
    decl("bucket_name", VarType::String, None, "Name of the S3 bucket"),
    decl(
        "allowed_db_cidr_blocks",
        VarType::List,
        None,
        "CIDR blocks allowed to reach the database",
    ),
    decl("db_deletion_protection", VarType::Bool, Some("false"), "Protect the database from deletion"),
    decl("db_backup_retention_days", VarType::Int, Some("7"), "Automated backup retention in days"),
    decl("s3_versioning", VarType::Bool, Some("true"), "Enable object versioning on the bucket"),
    decl("s3_force_destroy", VarType::Bool, Some("false"), "Empty the bucket before deleting it"),
    decl(
        "db_publicly_accessible",
        VarType::Bool,
        Some("false"),
        "Give the database a public endpoint",
    ),
    decl("db_instance_class", VarType::String, Some("db.t3.micro"), "Database instance class"),
    decl("db_allocated_storage", VarType::Int, Some("20"), "Allocated storage in GiB"),
    decl("db_engine_version", VarType::String, Some("16"), "PostgreSQL engine version"),
    decl("db_app_user", VarType::String, Some("modal_user"), "Application role inside the database"),
    decl(
        "db_app_password",
        VarType::Secret,
        Some(""),
        "Password of the application role (empty reuses db_password)",
    ),
    decl("db_schema", VarType::String, Some("agd"), "Schema owned by the application role"),
    decl(
        "db_bootstrap_tables",
        VarType::Bool,
        Some("true"),
        "Create the chart type enum and samples table",
    ),
    decl(
        "db_connect_timeout_secs",
        VarType::Int,
        Some("300"),
        "How long to wait for the database to accept connections",
    ),
    decl("vpc_id", VarType::String, Some(""), "VPC of the security group (empty uses the default VPC)"),
    decl("modal_secret_name", VarType::String, Some("aws"), "Name of the Modal secret"),
    decl(
        "modal_db_secret_name",
        VarType::String,
        Some("aws-rds"),
        "Name of the Modal secret carrying the database credentials",
    ),
];

/// Look up a catalog entry.
pub fn lookup(name: &str) -> Option<&'static VariableDecl> {
    CATALOG.iter().find(|d| d.name == name)
}

/// A typed variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Str(String),
    Bool(bool),
    Int(i64),
    List(Vec<String>),
    Secret(Secret),
}

impl VarValue {
    /// Text for display. Sensitive values are masked.
    pub fn display(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::List(l) => l.join(","),
            Self::Secret(s) if s.is_sensitive() => "(sensitive)".to_string(),
            Self::Secret(s) => s.expose(str::to_string),
        }
    }
}

/// Layer that supplied a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Default,
    EnvironmentFile,
    CommandLine,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::EnvironmentFile => write!(f, "environment file"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

#[derive(Debug, Clone)]
struct Resolved {
    value: VarValue,
    source: Source,
}

/// Fully resolved configuration, in catalog order.
#[derive(Debug, Clone)]
pub struct Context {
    values: IndexMap<String, Resolved>,
}

impl Context {
    fn get(&self, name: &str) -> Result<&VarValue, ConfigError> {
        self.values
            .get(name)
            .map(|r| &r.value)
            .ok_or_else(|| ConfigError::MissingRequiredVariable(name.to_string()))
    }

    fn mistyped(name: &str, expected: VarType) -> ConfigError {
        ConfigError::InvalidVariable {
            name: name.to_string(),
            reason: format!("expected a {}", expected.label()),
        }
    }

    pub fn string(&self, name: &str) -> Result<&str, ConfigError> {
        match self.get(name)? {
            VarValue::Str(s) => Ok(s),
            _ => Err(Self::mistyped(name, VarType::String)),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool, ConfigError> {
        match self.get(name)? {
            VarValue::Bool(b) => Ok(*b),
            _ => Err(Self::mistyped(name, VarType::Bool)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, ConfigError> {
        match self.get(name)? {
            VarValue::Int(i) => Ok(*i),
            _ => Err(Self::mistyped(name, VarType::Int)),
        }
    }

    pub fn list(&self, name: &str) -> Result<&[String], ConfigError> {
        match self.get(name)? {
            VarValue::List(l) => Ok(l),
            _ => Err(Self::mistyped(name, VarType::List)),
        }
    }

    pub fn secret(&self, name: &str) -> Result<&Secret, ConfigError> {
        match self.get(name)? {
            VarValue::Secret(s) => Ok(s),
            _ => Err(Self::mistyped(name, VarType::Secret)),
        }
    }

    /// Which layer supplied `name`.
    pub fn source(&self, name: &str) -> Option<Source> {
        self.values.get(name).map(|r| r.source)
    }

    /// `(name, display value, source)` for every variable.
    pub fn describe(&self) -> Vec<(String, String, Source)> {
        self.values
            .iter()
            .map(|(k, r)| (k.clone(), r.value.display(), r.source))
            .collect()
    }
}

/// Merge the layers over `catalog` and validate every value.
pub fn resolve(
    catalog: &[VariableDecl],
    env_layer: &IndexMap<String, Value>,
    cli_layer: &IndexMap<String, String>,
) -> Result<Context, ConfigError> {
    for key in env_layer.keys().chain(cli_layer.keys()) {
        if !catalog.iter().any(|d| d.name == key) {
            return Err(ConfigError::UnknownVariable(key.clone()));
        }
    }

    let mut values = IndexMap::new();
    for d in catalog {
        let resolved = if let Some(raw) = cli_layer.get(d.name) {
            Resolved {
                value: parse_text(d, raw)?,
                source: Source::CommandLine,
            }
        } else if let Some(raw) = env_layer.get(d.name) {
            Resolved {
                value: parse_yaml(d, raw)?,
                source: Source::EnvironmentFile,
            }
        } else if let Some(default) = d.default {
            Resolved {
                value: parse_text(d, default)?,
                source: Source::Default,
            }
        } else {
            return Err(ConfigError::MissingRequiredVariable(d.name.to_string()));
        };

        validate(d.name, &resolved.value).map_err(|reason| ConfigError::InvalidVariable {
            name: d.name.to_string(),
            reason,
        })?;
        tracing::debug!(variable = d.name, source = %resolved.source, "resolved");
        values.insert(d.name.to_string(), resolved);
    }

    Ok(Context { values })
}

fn invalid(d: &VariableDecl, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidVariable {
        name: d.name.to_string(),
        reason: reason.into(),
    }
}

/// Parse command-line or default text as the declared type.
fn parse_text(d: &VariableDecl, raw: &str) -> Result<VarValue, ConfigError> {
    match d.var_type {
        VarType::String => Ok(VarValue::Str(raw.to_string())),
        VarType::Secret => Ok(VarValue::Secret(Secret::new(d.name, raw))),
        VarType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(VarValue::Bool(true)),
            "false" | "no" | "0" => Ok(VarValue::Bool(false)),
            other => Err(invalid(d, format!("'{}' is not a bool", other))),
        },
        VarType::Int => raw
            .trim()
            .parse::<i64>()
            .map(VarValue::Int)
            .map_err(|_| invalid(d, format!("'{}' is not an integer", raw))),
        VarType::List => Ok(VarValue::List(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )),
    }
}

/// Parse an environment-file value as the declared type.
fn parse_yaml(d: &VariableDecl, raw: &Value) -> Result<VarValue, ConfigError> {
    match (d.var_type, raw) {
        (VarType::Bool, Value::Bool(b)) => Ok(VarValue::Bool(*b)),
        (VarType::Int, Value::Number(n)) => n
            .as_i64()
            .map(VarValue::Int)
            .ok_or_else(|| invalid(d, format!("'{}' is not an integer", n))),
        (VarType::List, Value::Sequence(items)) => items
            .iter()
            .map(|item| scalar_text(item).ok_or_else(|| invalid(d, "list items must be scalars")))
            .collect::<Result<Vec<_>, _>>()
            .map(VarValue::List),
        (_, other) => match scalar_text(other) {
            Some(text) => parse_text(d, &text),
            None => Err(invalid(d, format!("expected a {}", d.var_type.label()))),
        },
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,30}$").expect("valid name pattern"));
static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2}(-[a-z]+)+-[0-9]$").expect("valid region pattern"));
static BUCKET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("valid bucket pattern")
});
static SQL_IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("valid identifier pattern"));
static INSTANCE_CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^db\.[a-z0-9]+\.[a-z0-9]+$").expect("valid instance class pattern")
});
static ENGINE_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?$").expect("valid version pattern"));
static VPC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(vpc-[0-9a-f]{8,17})?$").expect("valid vpc pattern"));
static SECRET_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("valid secret name pattern"));

/// Domain checks beyond the declared type.
fn validate(name: &str, value: &VarValue) -> Result<(), String> {
    match (name, value) {
        ("environment" | "project", VarValue::Str(s)) => matches(&NAME_RE, s, "a lowercase name"),
        ("region", VarValue::Str(s)) => matches(&REGION_RE, s, "an AWS region"),
        ("bucket_name", VarValue::Str(s)) => validate_bucket_name(s),
        ("allowed_db_cidr_blocks", VarValue::List(blocks)) => {
            if blocks.is_empty() {
                return Err("at least one CIDR block is required".to_string());
            }
            blocks.iter().try_for_each(|b| validate_cidr(b))
        }
        ("db_backup_retention_days", VarValue::Int(days)) => {
            in_range(*days, 0, 35, "backup retention days")
        }
        ("db_allocated_storage", VarValue::Int(gib)) => in_range(*gib, 20, 65536, "storage GiB"),
        ("db_connect_timeout_secs", VarValue::Int(secs)) => {
            in_range(*secs, 1, 3600, "connect timeout seconds")
        }
        ("db_instance_class", VarValue::Str(s)) => {
            matches(&INSTANCE_CLASS_RE, s, "an instance class like db.t3.micro")
        }
        ("db_engine_version", VarValue::Str(s)) => {
            matches(&ENGINE_VERSION_RE, s, "an engine version like 16 or 16.3")
        }
        ("db_app_user" | "db_schema", VarValue::Str(s)) => {
            matches(&SQL_IDENT_RE, s, "a lowercase SQL identifier")
        }
        ("vpc_id", VarValue::Str(s)) => matches(&VPC_RE, s, "a VPC id or empty"),
        ("modal_secret_name" | "modal_db_secret_name", VarValue::Str(s)) => {
            matches(&SECRET_NAME_RE, s, "a secret name")
        }
        ("db_password", VarValue::Secret(s)) => s.expose(validate_password),
        ("db_app_password", VarValue::Secret(s)) => s.expose(|v| {
            if v.is_empty() {
                Ok(())
            } else {
                validate_password(v)
            }
        }),
        _ => Ok(()),
    }
}

fn matches(re: &Regex, value: &str, what: &str) -> Result<(), String> {
    if re.is_match(value) {
        Ok(())
    } else {
        Err(format!("'{}' is not {}", value, what))
    }
}

fn in_range(value: i64, min: i64, max: i64, what: &str) -> Result<(), String> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} must be between {} and {}, got {}", what, min, max, value))
    }
}

/// S3 bucket naming rules.
pub fn validate_bucket_name(name: &str) -> Result<(), String> {
    if !BUCKET_RE.is_match(name) {
        return Err(format!(
            "'{}' must be 3-63 lowercase letters, digits, dots or hyphens, starting and ending with a letter or digit",
            name
        ));
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return Err(format!("'{}' has adjacent separators", name));
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return Err(format!("'{}' is formatted as an IP address", name));
    }
    if name.starts_with("xn--") || name.ends_with("-s3alias") {
        return Err(format!("'{}' uses a reserved prefix or suffix", name));
    }
    Ok(())
}

/// IPv4 CIDR block, e.g. `10.0.0.0/16`.
pub fn validate_cidr(block: &str) -> Result<(), String> {
    let (addr, prefix) = block
        .split_once('/')
        .ok_or_else(|| format!("'{}' is not a CIDR block (missing /prefix)", block))?;
    addr.parse::<Ipv4Addr>()
        .map_err(|_| format!("'{}' has an invalid IPv4 address", block))?;
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => Err(format!("'{}' has an invalid prefix length", block)),
    }
}

/// Master password constraints of the database engine.
fn validate_password(value: &str) -> Result<(), String> {
    if value.len() < 8 || value.len() > 128 {
        return Err("password must be 8-128 characters".to_string());
    }
    if value
        .chars()
        .any(|c| matches!(c, '/' | '"' | '@' | ' ') || !c.is_ascii_graphic())
    {
        return Err("password may not contain '/', '\"', '@', spaces or non-printable characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> IndexMap<String, String> {
        IndexMap::from([
            ("db_password".to_string(), "correct-horse-battery".to_string()),
            ("bucket_name".to_string(), "agd-dev-tyson".to_string()),
            ("allowed_db_cidr_blocks".to_string(), "10.0.0.0/16, 192.168.1.0/24".to_string()),
        ])
    }

    fn yaml(s: &str) -> IndexMap<String, Value> {
        serde_yaml_ng::from_str(s).unwrap()
    }

    #[test]
    fn test_variables_defaults_apply() {
        let ctx = resolve(CATALOG, &IndexMap::new(), &required()).unwrap();
        assert_eq!(ctx.string("region").unwrap(), "ca-central-1");
        assert_eq!(ctx.string("environment").unwrap(), "dev");
        assert!(!ctx.bool("db_deletion_protection").unwrap());
        assert_eq!(ctx.int("db_backup_retention_days").unwrap(), 7);
        assert!(ctx.bool("s3_versioning").unwrap());
        assert_eq!(ctx.source("region"), Some(Source::Default));
        assert_eq!(
            ctx.list("allowed_db_cidr_blocks").unwrap(),
            ["10.0.0.0/16", "192.168.1.0/24"]
        );
    }

    #[test]
    fn test_variables_precedence_cli_over_file_over_default() {
        let env = yaml("db_backup_retention_days: 14\ns3_versioning: false\n");
        let mut cli = required();
        cli.insert("db_backup_retention_days".to_string(), "21".to_string());
        let ctx = resolve(CATALOG, &env, &cli).unwrap();
        assert_eq!(ctx.int("db_backup_retention_days").unwrap(), 21);
        assert_eq!(ctx.source("db_backup_retention_days"), Some(Source::CommandLine));
        assert!(!ctx.bool("s3_versioning").unwrap());
        assert_eq!(ctx.source("s3_versioning"), Some(Source::EnvironmentFile));
    }

    #[test]
    fn test_variables_missing_password() {
        let mut cli = required();
        cli.shift_remove("db_password");
        let err = resolve(CATALOG, &IndexMap::new(), &cli).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequiredVariable(ref n) if n == "db_password"));
    }

    #[test]
    fn test_variables_unknown_key() {
        let env = yaml("db_pasword: typo\n");
        let err = resolve(CATALOG, &env, &required()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVariable(ref n) if n == "db_pasword"));
    }

    #[test]
    fn test_variables_yaml_list_and_numbers() {
        let env = yaml("allowed_db_cidr_blocks:\n  - 10.1.0.0/16\ndb_engine_version: 16\n");
        let mut cli = required();
        cli.shift_remove("allowed_db_cidr_blocks");
        let ctx = resolve(CATALOG, &env, &cli).unwrap();
        assert_eq!(ctx.list("allowed_db_cidr_blocks").unwrap(), ["10.1.0.0/16"]);
        assert_eq!(ctx.string("db_engine_version").unwrap(), "16");
    }

    #[test]
    fn test_variables_bad_bool() {
        let mut cli = required();
        cli.insert("s3_versioning".to_string(), "maybe".to_string());
        let err = resolve(CATALOG, &IndexMap::new(), &cli).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVariable { ref name, .. } if name == "s3_versioning"));
    }

    #[test]
    fn test_variables_bad_cidr() {
        let mut cli = required();
        cli.insert("allowed_db_cidr_blocks".to_string(), "10.0.0.0/33".to_string());
        assert!(resolve(CATALOG, &IndexMap::new(), &cli).is_err());
        cli.insert("allowed_db_cidr_blocks".to_string(), "10.0.0.0".to_string());
        assert!(resolve(CATALOG, &IndexMap::new(), &cli).is_err());
        cli.insert("allowed_db_cidr_blocks".to_string(), "".to_string());
        assert!(resolve(CATALOG, &IndexMap::new(), &cli).is_err());
    }

    #[test]
    fn test_variables_bucket_rules() {
        assert!(validate_bucket_name("agd-dev-tyson").is_ok());
        assert!(validate_bucket_name("my.bucket.name").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("Upper").is_err());
        assert!(validate_bucket_name("a..b").is_err());
        assert!(validate_bucket_name("192.168.1.1").is_err());
        assert!(validate_bucket_name("xn--bucket").is_err());
        assert!(validate_bucket_name("-leading").is_err());
    }

    #[test]
    fn test_variables_retention_range() {
        let mut cli = required();
        cli.insert("db_backup_retention_days".to_string(), "36".to_string());
        assert!(resolve(CATALOG, &IndexMap::new(), &cli).is_err());
    }

    #[test]
    fn test_variables_password_rules() {
        let mut cli = required();
        cli.insert("db_password".to_string(), "short".to_string());
        assert!(resolve(CATALOG, &IndexMap::new(), &cli).is_err());
        cli.insert("db_password".to_string(), "has@symbol1".to_string());
        assert!(resolve(CATALOG, &IndexMap::new(), &cli).is_err());
    }

    #[test]
    fn test_variables_secret_masked() {
        let ctx = resolve(CATALOG, &IndexMap::new(), &required()).unwrap();
        let described = ctx.describe();
        let pw = described.iter().find(|(n, _, _)| n == "db_password").unwrap();
        assert_eq!(pw.1, "(sensitive)");
        assert!(ctx.secret("db_password").unwrap().is_sensitive());
        assert!(!format!("{:?}", ctx).contains("correct-horse-battery"));
    }

    #[test]
    fn test_variables_wrong_type_getter() {
        let ctx = resolve(CATALOG, &IndexMap::new(), &required()).unwrap();
        assert!(ctx.bool("region").is_err());
    }

    #[test]
    fn test_variables_catalog_unique() {
        for (i, d) in CATALOG.iter().enumerate() {
            assert!(
                CATALOG[i + 1..].iter().all(|o| o.name != d.name),
                "duplicate {}",
                d.name
            );
        }
        assert!(lookup("db_password").is_some_and(|d| d.default.is_none()));
    }
}
