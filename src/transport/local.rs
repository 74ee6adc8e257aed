//! Local execution transport.

use super::ExecOutput;
use std::io::Write;
use std::process::{Command, Stdio};
use zeroize::Zeroizing;

/// Pipe `script` to `bash -s`. The AWS CLI pager is disabled so output is
/// never held for a terminal.
pub fn exec_local(script: &str) -> Result<ExecOutput, String> {
    let mut child = Command::new("bash")
        .arg("-s")
        .env("AWS_PAGER", "")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn bash: {}", e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .map_err(|e| format!("stdin write error: {}", e))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("wait error: {}", e))?;
    let stdout = Zeroizing::new(output.stdout);

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: Zeroizing::new(String::from_utf8_lossy(&stdout).into_owned()),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
