//! Modal secrets read by the pipeline's functions.
//!
//! Attributes prefixed with `env.` form the secret payload, one environment
//! variable per attribute. `aws` carries the IAM credentials for the bucket,
//! `aws-rds` the application role's connection settings.

use super::iam::KEY_ID;
use super::{base_spec, postgres, rds};
use crate::core::error::ConfigError;
use crate::core::types::{AttrValue, ResourceKind, ResourceSpec};
use crate::core::variables::Context;

pub const ID: &str = "modal-secret";
pub const DB_ID: &str = "modal-db-secret";
pub const PAYLOAD_PREFIX: &str = "env.";

pub fn spec(ctx: &Context) -> Result<ResourceSpec, ConfigError> {
    let region = ctx.string("region")?;
    Ok(
        base_spec(ctx, ID, ResourceKind::ExternalSecret, ctx.string("modal_secret_name")?)?
            .attr("env.AWS_ACCESS_KEY_ID", AttrValue::reference(KEY_ID, "access_key_id"))
            .attr(
                "env.AWS_SECRET_ACCESS_KEY",
                AttrValue::reference(KEY_ID, "secret_access_key"),
            )
            .attr("env.AWS_REGION", region)
            .attr("env.AWS_DEFAULT_REGION", region)
            .after(KEY_ID),
    )
}

/// Database credentials of the application role. Pushed once the role
/// exists, so the password in the store always opens a session.
pub fn db_spec(ctx: &Context) -> Result<ResourceSpec, ConfigError> {
    Ok(base_spec(
        ctx,
        DB_ID,
        ResourceKind::ExternalSecret,
        ctx.string("modal_db_secret_name")?,
    )?
    .attr("env.DB_HOST", AttrValue::reference(rds::ID, "address"))
    .attr("env.DB_PORT", AttrValue::reference(rds::ID, "port"))
    .attr("env.DB_NAME", postgres::ADMIN_DATABASE)
    .attr("env.DB_USER", ctx.string("db_app_user")?)
    .attr("env.DB_PASSWORD", postgres::role_password(ctx)?)
    .after(postgres::ID))
}
