use super::{EngineError, EngineInvocation, EngineInvoker};
use async_trait::async_trait;
use log::{debug, error, warn};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// [`EngineInvoker`] spawning one OS process per call.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    timeout: Duration,
}

impl ProcessEngine {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl EngineInvoker for ProcessEngine {
    async fn invoke(&self, invocation: EngineInvocation) -> Result<String, EngineError> {
        debug!(
            "Invoking engine: program={}, args={:?}, env_keys={:?}, working_dir={:?}",
            invocation.program,
            invocation.args,
            invocation.env.keys().collect::<Vec<_>>(),
            invocation.working_dir
        );

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| {
            error!("Failed to spawn {}: {}", invocation.program, source);
            EngineError::Spawn {
                program: invocation.program.clone(),
                source,
            }
        })?;

        // Dropping the pending wait on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    "Engine {} timed out after {:?}, process killed",
                    invocation.program, self.timeout
                );
                return Err(EngineError::Timeout {
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(stderr.trim());
            }
            error!(
                "Engine {} exited with {:?}",
                invocation.program,
                output.status.code()
            );
            return Err(EngineError::Execution {
                exit_code: output.status.code(),
                output: text,
            });
        }

        String::from_utf8(output.stdout).map_err(|_| EngineError::InvalidOutput)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn shell(script: &str, extra: &[&str]) -> EngineInvocation {
        let mut args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        args.extend(extra.iter().map(|a| a.to_string()));
        EngineInvocation {
            program: "/bin/sh".to_string(),
            args,
            ..Default::default()
        }
    }

    fn engine() -> ProcessEngine {
        ProcessEngine::new(Duration::from_secs(10))
    }

    #[test_log::test(tokio::test)]
    async fn captures_standard_output() {
        let output = engine().invoke(shell("echo hello", &[])).await.unwrap();
        assert_eq!(output, "hello\n");
    }

    #[test_log::test(tokio::test)]
    async fn passes_hostile_arguments_verbatim() {
        let hostile = "revenue\"; rm -rf / #'$(whoami)";
        let output = engine()
            .invoke(shell("printf '%s' \"$1\"", &[hostile]))
            .await
            .unwrap();
        assert_eq!(output, hostile);
    }

    #[test_log::test(tokio::test)]
    async fn merges_environment_overrides() {
        let mut invocation = shell("printf '%s' \"$MAPI_PASSWORD\"", &[]);
        let mut env = BTreeMap::new();
        env.insert("MAPI_PASSWORD".to_string(), "s3cret".to_string());
        invocation.env = env;

        let output = engine().invoke(invocation).await.unwrap();
        assert_eq!(output, "s3cret");
    }

    #[test_log::test(tokio::test)]
    async fn runs_in_working_directory() {
        let mut invocation = shell("pwd", &[]);
        invocation.working_dir = Some("/".into());
        let output = engine().invoke(invocation).await.unwrap();
        assert_eq!(output.trim(), "/");
    }

    #[test_log::test(tokio::test)]
    async fn reports_exit_code_and_diagnostics() {
        let err = engine()
            .invoke(shell("echo 'Compilation Error'; echo 'bad grain' >&2; exit 3", &[]))
            .await
            .unwrap_err();
        match err {
            EngineError::Execution { exit_code, output } => {
                assert_eq!(exit_code, Some(3));
                assert!(output.contains("Compilation Error"));
                assert!(output.contains("bad grain"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn times_out_long_running_commands() {
        let engine = ProcessEngine::new(Duration::from_millis(100));
        let err = engine.invoke(shell("sleep 5", &[])).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let marker_arg = marker.to_string_lossy().into_owned();

        let engine = ProcessEngine::new(Duration::from_millis(200));
        let err = engine
            .invoke(shell("sleep 1; touch \"$1\"", &[marker_arg.as_str()]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[test_log::test(tokio::test)]
    async fn fails_to_spawn_missing_program() {
        let invocation = EngineInvocation {
            program: "/nonexistent/mapi-engine".to_string(),
            ..Default::default()
        };
        let err = engine().invoke(invocation).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
