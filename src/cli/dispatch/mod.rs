use crate::cli::actions::Action;
use crate::cli::commands;
use anyhow::Result;
use std::path::PathBuf;

/// # Errors
/// Returns an error if a required argument is missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    Ok(Action::Server {
        port: matches
            .get_one::<u16>(commands::ARG_PORT)
            .copied()
            .unwrap_or(9090),
        config: matches
            .get_one::<String>(commands::ARG_CONFIG)
            .map(PathBuf::from),
        local_ssh: matches.get_flag(commands::ARG_LOCAL_SSH),
        no_tls: matches.get_flag(commands::ARG_NO_TLS),
    })
}
