use anyhow::Context;
use argus_core::config::Config;
use argus_core::runtime::Argus;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub fn run(config_path: &Path, log_level: Option<&str>) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    crate::init_logging(log_level.unwrap_or(config.settings.log_level()))?;

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!("{problem}");
        }
        anyhow::bail!("config has {} problem(s)", problems.len());
    }
    let shutdown_timeout = config.settings.shutdown_timeout()?;

    let rt = tokio::runtime::Runtime::new()?;
    let config_path = config_path.to_path_buf();
    rt.block_on(async move {
        let token = CancellationToken::new();
        let argus = Argus::start(config, Some(config_path), token)
            .context("failed to start")?;

        wait_for_signal().await;
        argus
            .shutdown(shutdown_timeout)
            .await
            .context("unclean shutdown")?;
        Ok(())
    })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
