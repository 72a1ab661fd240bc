use std::sync::Arc;

use futures::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::info;

use kitroom::config::Config;
use kitroom::engine::Engine;
use kitroom::limits::MAX_TAG_LEN;
use kitroom::seed::Seed;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = Config::from_env();
    kitroom::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::new(config.wal_path(), config.session_timeout)?);
    if let Some(path) = &config.seed {
        Seed::load(path)?.apply(&engine).await?;
    }
    tokio::spawn(kitroom::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    info!("kitroom kiosk ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  session timeout: {}s", config.session_timeout.as_secs());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // The reader types each tag followed by Enter.
    let mut scans = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_TAG_LEN),
    );

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    // FramedRead yields a single None after a decode error, then resumes.
    let mut recovering = false;
    loop {
        tokio::select! {
            line = scans.next() => {
                let tag = match line {
                    Some(Ok(tag)) => tag,
                    Some(Err(e)) => {
                        tracing::warn!("unreadable scan: {e}");
                        recovering = true;
                        continue;
                    }
                    None if recovering => {
                        recovering = false;
                        continue;
                    }
                    None => {
                        info!("reader closed");
                        break;
                    }
                };
                if tag.trim().is_empty() {
                    continue;
                }
                let response = match engine.scan(&tag).await {
                    Ok(outcome) => serde_json::to_string(&outcome)?,
                    Err(e) => serde_json::json!({ "kind": "error", "message": e.to_string() }).to_string(),
                };
                println!("{response}");
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("kitroom stopped");
    Ok(())
}
