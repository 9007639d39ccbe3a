use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::ArgMatches;
use tablesink_config::{Config, OverridableConfig};

use crate::cliapp::make_app;
use crate::setup;

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    match matches.subcommand() {
        Some(("run", matches)) => {
            let mut config = load_config(matches)?;
            config.apply_override(extract_config_args(matches))?;
            run(config)
        }
        Some(("config", matches)) => manage_config(matches),
        _ => unreachable!(),
    }
}

/// Loads the config from the folder given with `--config`, defaulting to `./config`.
fn load_config(matches: &ArgMatches) -> Result<Config> {
    let config_path = matches
        .get_one::<PathBuf>("config")
        .map_or(Path::new("config"), PathBuf::as_path);

    if !Config::config_exists(config_path) {
        bail!(
            "config file not found in {}, create a config.yml there or pass --config",
            config_path.display()
        );
    }

    Ok(Config::from_path(config_path)?)
}

/// Extract config arguments from a parsed command line arguments object.
fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    let value = |name: &str| matches.get_one::<String>(name).cloned();

    OverridableConfig {
        store_host: value("store_host"),
        store_http_path: value("store_http_path"),
        store_token: value("store_token"),
        table: value("table"),
        host: value("host"),
        port: value("port"),
        shutdown_timeout: value("shutdown_timeout"),
    }
}

fn manage_config(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("show", matches)) => show_config(&load_config(matches)?, matches.get_flag("debug")),
        _ => unreachable!(),
    }
}

fn show_config(config: &Config, debug: bool) -> Result<()> {
    let rendered = if debug {
        format!("{config:#?}\n")
    } else {
        config.to_yaml_string()?
    };

    io::stdout().write_all(rendered.as_bytes())?;
    Ok(())
}

fn run(config: Config) -> Result<()> {
    tablesink_log::init(config.logging());
    setup::dump_spawn_infos(&config);
    setup::check_config(&config)?;
    setup::init_metrics(&config)?;
    tablesink_server::run(config)?;
    Ok(())
}
