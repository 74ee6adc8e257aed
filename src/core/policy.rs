//! IAM policy documents.

use serde::Serialize;

const POLICY_VERSION: &str = "2012-10-17";

/// One IAM statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    #[serde(rename = "Sid")]
    sid: String,
    #[serde(rename = "Effect")]
    effect: String,
    #[serde(rename = "Action")]
    actions: Vec<String>,
    #[serde(rename = "Resource")]
    resources: Vec<String>,
}

impl Statement {
    fn allow(sid: &str, actions: &[&str], resources: &[String]) -> Self {
        Self {
            sid: sid.to_string(),
            effect: "Allow".to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources: resources.to_vec(),
        }
    }

    pub fn effect(&self) -> &str {
        &self.effect
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }
}

/// Immutable IAM policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Statement")]
    statements: Vec<Statement>,
}

impl PolicyDocument {
    /// Read/write access to one bucket and its objects.
    pub fn bucket_access(bucket: &str) -> Self {
        let bucket_arn = bucket_arn(bucket);
        let objects_arn = format!("{}/*", bucket_arn);
        Self {
            version: POLICY_VERSION.to_string(),
            statements: vec![
                Statement::allow(
                    "ListBucket",
                    &["s3:ListBucket", "s3:GetBucketLocation"],
                    &[bucket_arn],
                ),
                Statement::allow(
                    "ObjectReadWrite",
                    &["s3:GetObject", "s3:PutObject", "s3:DeleteObject"],
                    &[objects_arn],
                ),
            ],
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Compact JSON in the IAM policy grammar.
    pub fn to_json(&self) -> String {
        let statements: Vec<serde_json::Value> = self
            .statements
            .iter()
            .map(|s| {
                serde_json::json!({
                    "Sid": s.sid,
                    "Effect": s.effect,
                    "Action": s.actions,
                    "Resource": s.resources,
                })
            })
            .collect();
        serde_json::json!({
            "Version": self.version,
            "Statement": statements,
        })
        .to_string()
    }
}

/// ARN of an S3 bucket.
pub fn bucket_arn(bucket: &str) -> String {
    format!("arn:aws:s3:::{}", bucket)
}
