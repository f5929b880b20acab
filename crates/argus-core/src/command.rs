//! Runs a service's templated commands.

use crate::error::{ArgusError, Result};
use crate::types::TemplateVars;
use tokio::process::Command;

/// Run one argv with `{{ … }}` placeholders filled from `vars`.
/// Exit status 0 is success.
pub async fn run_command(argv: &[String], vars: &TemplateVars) -> Result<()> {
    let rendered: Vec<String> = argv.iter().map(|a| vars.render(a)).collect();
    let (program, args) = rendered
        .split_first()
        .ok_or_else(|| ArgusError::Action("empty command".into()))?;

    tracing::info!(service = %vars.service_id, command = %rendered.join(" "), "running command");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ArgusError::Action(format!("{program}: {e}")))?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!(service = %vars.service_id, output = %stdout.trim(), "command output");
        }
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ArgusError::Action(format!(
        "command {:?} failed ({}): {}",
        rendered.join(" "),
        output.status,
        stderr.trim()
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn renders_and_runs() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let vars = TemplateVars {
            version: "1.2.3".into(),
            ..Default::default()
        };
        let cmd = argv(&[
            "sh",
            "-c",
            &format!("echo {{{{ version }}}} > {}", out.display()),
        ]);
        run_command(&cmd, &vars).await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "1.2.3");
    }

    #[tokio::test]
    async fn non_zero_exit_is_error() {
        let err = run_command(&argv(&["sh", "-c", "echo nope >&2; exit 3"]), &TemplateVars::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"), "{err}");
    }

    #[tokio::test]
    async fn missing_program_is_error() {
        assert!(run_command(&argv(&["definitely-not-a-real-binary-xyz"]), &TemplateVars::default())
            .await
            .is_err());
        assert!(run_command(&[], &TemplateVars::default()).await.is_err());
    }
}
