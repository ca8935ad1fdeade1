use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";
pub const ARG_CONFIG: &str = "config";
pub const ARG_LOCAL_SSH: &str = "local-ssh";
pub const ARG_NO_TLS: &str = "no-tls";
pub const ARG_VERBOSITY: &str = "verbosity";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("enirejo")
        .about("Authentication broker for the web console")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("9090")
                .env("ENIREJO_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_CONFIG)
                .short('c')
                .long("config")
                .help("Path to the broker configuration file")
                .env("ENIREJO_CONFIG"),
        )
        .arg(
            Arg::new(ARG_LOCAL_SSH)
                .long("local-ssh")
                .help("Log in through SSH even for localhost")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_NO_TLS)
                .long("no-tls")
                .help("Serve plain HTTP; session cookies lose the Secure attribute")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .help("Verbosity level (-v warn, -vv info, -vvv debug)")
                .action(ArgAction::Count),
        )
}
