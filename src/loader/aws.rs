//! S3 and SSM Parameter Store fetchers, via the system `aws` CLI.

use anyhow::{Context, Result};
use serde::Deserialize;

use super::command::ToolCommand;

/// Fetch an object's body from `s3://bucket/key`.
pub async fn s3_get(url: &str) -> Result<String> {
    ToolCommand::aws()
        .args(["s3", "cp", url, "-"])
        .output()
        .await
        .with_context(|| format!("failed to fetch '{url}'"))
}

/// Fetch a single SSM parameter, decrypting SecureString values.
pub async fn ssm_get_parameter(name: &str) -> Result<String> {
    ToolCommand::aws()
        .args([
            "ssm",
            "get-parameter",
            "--name",
            name,
            "--with-decryption",
            "--query",
            "Parameter.Value",
            "--output",
            "text",
        ])
        .output_trimmed()
        .await
        .with_context(|| format!("failed to fetch ssm parameter '{name}'"))
}

#[derive(Deserialize)]
struct ParameterPage {
    #[serde(rename = "Parameters")]
    parameters: Vec<Parameter>,
}

#[derive(Deserialize)]
struct Parameter {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: String,
}

/// Fetch every parameter under a path prefix as `(name, value)` pairs.
///
/// The CLI paginates internally, so a single invocation returns the full
/// set. Names come back fully qualified; the caller relativises them
/// against the prefix.
pub async fn ssm_get_parameters_by_path(prefix: &str) -> Result<Vec<(String, String)>> {
    let raw = ToolCommand::aws()
        .args([
            "ssm",
            "get-parameters-by-path",
            "--path",
            prefix,
            "--recursive",
            "--with-decryption",
            "--output",
            "json",
        ])
        .output()
        .await
        .with_context(|| format!("failed to fetch ssm parameters under '{prefix}'"))?;

    let page: ParameterPage = serde_json::from_str(&raw)
        .with_context(|| format!("unexpected ssm output for prefix '{prefix}'"))?;
    Ok(page.parameters.into_iter().map(|p| (p.name, p.value)).collect())
}

/// Strip the path prefix from each parameter name.
///
/// The prefix is always `/`-terminated by location resolution, so the
/// remainder is the parameter's relative name.
pub fn relativize_parameters(
    prefix: &str,
    params: Vec<(String, String)>,
) -> Vec<(String, String)> {
    params
        .into_iter()
        .map(|(name, value)| {
            let relative = name.strip_prefix(prefix).unwrap_or(&name).to_owned();
            (relative, value)
        })
        .collect()
}
