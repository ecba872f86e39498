use std::process::Stdio;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;
use tracing::instrument;

use k8_config::ExecConfig;

use crate::ClientError;
use crate::Result;

pub const DEFAULT_EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";
const EXEC_INFO_ENV: &str = "KUBERNETES_EXEC_INFO";
/// helpers still running after this long are killed
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// document printed by the helper on stdout
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredential {
    pub api_version: Option<String>,
    pub kind: Option<String>,
    pub status: Option<ExecCredentialStatus>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredentialStatus {
    pub token: Option<String>,
    pub client_certificate_data: Option<String>,
    pub client_key_data: Option<String>,
    pub expiration_timestamp: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for ExecCredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCredentialStatus")
            .field("token", &self.token.is_some())
            .field("client_certificate_data", &self.client_certificate_data.is_some())
            .field("client_key_data", &self.client_key_data.is_some())
            .field("expiration_timestamp", &self.expiration_timestamp)
            .finish()
    }
}

/// run the helper once and parse what it printed
pub async fn execute(exec: &ExecConfig) -> Result<ExecCredentialStatus> {
    execute_with_timeout(exec, EXEC_TIMEOUT).await
}

#[instrument(skip(exec), fields(command = %exec.command))]
pub(crate) async fn execute_with_timeout(
    exec: &ExecConfig,
    timeout: Duration,
) -> Result<ExecCredentialStatus> {
    let api_version = exec
        .api_version
        .as_deref()
        .unwrap_or(DEFAULT_EXEC_API_VERSION);
    let exec_info = json!({
        "apiVersion": api_version,
        "kind": "ExecCredential",
        "spec": { "interactive": false },
    });

    let mut command = Command::new(&exec.command);
    command
        .args(&exec.args)
        .env(EXEC_INFO_ENV, exec_info.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for var in &exec.env {
        command.env(&var.name, &var.value);
    }

    debug!(args = ?exec.args, "running credential helper");
    // dropping the output future kills the child
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| ClientError::ExecFailed {
            command: exec.command.clone(),
            code: None,
            stderr: format!("timed out after {}s", timeout.as_secs_f32()),
        })?
        .map_err(|err| ClientError::ExecFailed {
            command: exec.command.clone(),
            code: None,
            stderr: match &exec.install_hint {
                Some(hint) => format!("{err}; {hint}"),
                None => err.to_string(),
            },
        })?;

    if !output.status.success() {
        return Err(ClientError::ExecFailed {
            command: exec.command.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    parse_output(&exec.command, &output.stdout)
}

pub(crate) fn parse_output(command: &str, stdout: &[u8]) -> Result<ExecCredentialStatus> {
    let malformed = |msg: String| ClientError::ExecOutput {
        command: command.to_owned(),
        msg,
    };

    let credential: ExecCredential =
        serde_json::from_slice(stdout).map_err(|err| malformed(err.to_string()))?;
    if let Some(kind) = &credential.kind {
        if kind != "ExecCredential" {
            return Err(malformed(format!("unexpected kind {kind}")));
        }
    }

    let status = credential
        .status
        .ok_or_else(|| malformed("missing status".to_owned()))?;
    let has_cert = status.client_certificate_data.is_some() && status.client_key_data.is_some();
    if status.token.is_none() && !has_cert {
        return Err(malformed(
            "status has neither token nor client certificate data".to_owned(),
        ));
    }
    Ok(status)
}

/// helpers may hand back PEM or base64 encoded PEM
pub(crate) fn pem_bytes(data: &str, field: &str) -> Result<Vec<u8>> {
    let trimmed = data.trim();
    if trimmed.starts_with("-----BEGIN") {
        Ok(trimmed.as_bytes().to_vec())
    } else {
        STANDARD
            .decode(trimmed)
            .map_err(|err| ClientError::InvalidRequest(format!("{field} is not valid base64: {err}")))
    }
}
