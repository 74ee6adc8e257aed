//! Script execution transport.
//!
//! Every side effect is a generated bash script piped to a shell. Scripts
//! may carry secrets in heredocs, so they never appear in argv, and output
//! is kept in zeroizing buffers.

pub mod local;

use zeroize::Zeroizing;

/// Output from executing a script.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Zeroizing<String>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, or the exit code if stderr is empty.
    pub fn error_message(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }
}

/// Something that runs scripts.
pub trait Transport {
    fn exec(&self, script: &str) -> Result<ExecOutput, String>;
}

/// Runs scripts with the local `bash`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn exec(&self, script: &str) -> Result<ExecOutput, String> {
        local::exec_local(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(exit_code: i32, stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_code,
            stdout: Zeroizing::new(String::new()),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_transport_exec_output_success() {
        assert!(out(0, "").success());
        assert!(!out(1, "err").success());
        assert!(!out(137, "killed").success());
    }

    #[test]
    fn test_transport_error_message_last_line() {
        let o = out(
            254,
            "\nAn error occurred (DBInstanceNotFound) when calling the DescribeDBInstances operation: DBInstance x not found.\n\n",
        );
        assert!(o.error_message().starts_with("An error occurred (DBInstanceNotFound)"));
        assert_eq!(out(3, "  \n").error_message(), "exit code 3");
    }

    #[test]
    fn test_transport_local_dispatch() {
        let o = LocalTransport.exec("echo ok").unwrap();
        assert!(o.success());
        assert_eq!(o.stdout.trim(), "ok");
    }
}
