use clap::{Arg, ArgMatches, Command};
use log::info;

use crate::config::Config;
use crate::utils::error::ModbusError;

pub fn build_cli() -> Command {
    Command::new("mbserver")
        .version(crate::VERSION)
        .about("In-memory Modbus/TCP server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .help("Address to listen on, e.g. 0.0.0.0:502"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("error, warn, info, debug or trace"),
        )
        .arg(
            Arg::new("max-connections")
                .long("max-connections")
                .value_name("N")
                .help("Maximum simultaneous clients, 0 for unlimited"),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write the default configuration to a file")
                .arg(Arg::new("path").required(true).value_name("PATH")),
        )
        .subcommand(
            Command::new("check-config").about("Validate and print the effective configuration"),
        )
}

/// Run a subcommand if one was given. Returns `true` when the process should
/// exit instead of starting the server.
pub fn handle_subcommands(matches: &ArgMatches, config: &Config) -> Result<bool, ModbusError> {
    if let Some(matches) = matches.subcommand_matches("init-config") {
        let path = matches
            .get_one::<String>("path")
            .ok_or_else(|| ModbusError::ConfigError("missing path".to_string()))?;

        info!("📝 Writing default configuration to {}", path);
        Config::default().save_to_file(path)?;
        println!("✅ Default configuration written to {}", path);
        return Ok(true);
    }

    if matches.subcommand_matches("check-config").is_some() {
        config.validate()?;
        println!("{}", toml::to_string_pretty(config)?);
        println!("✅ Configuration is valid");
        return Ok(true);
    }

    Ok(false)
}
