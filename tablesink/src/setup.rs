use anyhow::{Result, bail};
use tablesink_config::Config;
use tablesink_statsd::MetricsClientConfig;

/// Checks that the configuration contains everything needed to run.
pub fn check_config(config: &Config) -> Result<()> {
    config.table()?;

    let store = config.databricks();
    if store.host.is_empty() {
        bail!("no store host configured, set store.host or TABLESINK_STORE_HOST");
    }

    if store.token.is_empty() {
        bail!("no store token configured, set store.token or TABLESINK_STORE_TOKEN");
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        tablesink_log::info!("launching tablesink without config folder");
    } else {
        tablesink_log::info!(
            "launching tablesink from config folder {}",
            config.path().display()
        );
    }

    match config.table() {
        Ok(table) => tablesink_log::info!("  table: {table}"),
        Err(_) => tablesink_log::info!("  table: -"),
    }
    tablesink_log::info!(
        "  flush interval: {}s",
        config.exporter().flush_interval().as_secs()
    );
    tablesink_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(host) = config.statsd_addr() else {
        return Ok(());
    };

    tablesink_statsd::init(MetricsClientConfig {
        prefix: config.metrics_prefix(),
        host,
        default_tags: config.metrics_default_tags().clone(),
        default_sample_rate: f64::from(config.metrics_sample_rate()).into(),
        buffering: config.metrics_buffering(),
    })?;

    Ok(())
}
