//! Stratum: provision the AGD data-pipeline stack.
//!
//! PostgreSQL on RDS behind a security group, an S3 bucket, an IAM user with
//! a bucket policy and an access key, an application role inside the
//! database, and the access key forwarded to a Modal secret. Applied in
//! dependency order, idempotently, with state recorded per environment.

pub mod cli;
pub mod core;
pub mod provider;
pub mod resources;
pub mod secrets;
pub mod transport;
pub mod tripwire;
