//! This module implements the definition of the command line app.

use clap::builder::ValueParser;
use clap::{Arg, ArgAction, Command};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Buffers serving endpoint metrics and upserts them into a table store.";

pub fn make_app() -> Command {
    Command::new("tablesink")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(ValueParser::path_buf())
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Run the receiver and exporter")
                .after_help(
                    "This runs tablesink in the foreground until it's shut down. It will bind \
                     to the port and network interface configured in the config file, and \
                     flush buffered metrics into the configured table.",
                )
                .arg(
                    Arg::new("store_host")
                        .value_name("HOST")
                        .long("store-host")
                        .env("TABLESINK_STORE_HOST")
                        .help("The workspace host of the table store."),
                )
                .arg(
                    Arg::new("store_http_path")
                        .value_name("PATH")
                        .long("store-http-path")
                        .env("TABLESINK_STORE_HTTP_PATH")
                        .help("The HTTP path of the SQL warehouse."),
                )
                .arg(
                    Arg::new("store_token")
                        .value_name("TOKEN")
                        .long("store-token")
                        .env("TABLESINK_STORE_TOKEN")
                        .hide_env_values(true)
                        .help("The access token of the table store."),
                )
                .arg(
                    Arg::new("table")
                        .value_name("TABLE")
                        .long("table")
                        .env("TABLESINK_TABLE")
                        .help("The table to upsert metrics into, such as catalog.schema.table."),
                )
                .arg(
                    Arg::new("host")
                        .value_name("HOST")
                        .long("host")
                        .short('H')
                        .env("TABLESINK_HOST")
                        .help("The host the HTTP server binds to."),
                )
                .arg(
                    Arg::new("port")
                        .value_name("PORT")
                        .long("port")
                        .short('P')
                        .env("TABLESINK_PORT")
                        .help("The port the HTTP server binds to."),
                )
                .arg(
                    Arg::new("shutdown_timeout")
                        .value_name("SECONDS")
                        .long("shutdown-timeout")
                        .env("TABLESINK_SHUTDOWN_TIMEOUT")
                        .help("Maximum number of seconds to wait for pending flushes on shutdown."),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the tablesink config")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("show")
                        .about("Show the entire config out for debugging purposes")
                        .after_help("Secrets such as the store token are redacted.")
                        .arg(
                            Arg::new("debug")
                                .long("debug")
                                .action(ArgAction::SetTrue)
                                .help("Print the internal structure instead of YAML."),
                        ),
                ),
        )
}
