pub mod server;

use std::path::PathBuf;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        config: Option<PathBuf>,
        local_ssh: bool,
        no_tls: bool,
    },
}
