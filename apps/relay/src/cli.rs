use std::path::PathBuf;

use clap::Parser;
use relay_common::GlobalConfigPatch;

#[derive(Parser, Debug)]
#[command(name = "relay", about = "OpenAI-compatible relay gateway")]
pub(crate) struct Cli {
    /// Bootstrap file with channels, tokens, users and rates.
    #[arg(long, env = "RELAY_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    #[arg(long, env = "RELAY_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "RELAY_PORT")]
    pub(crate) port: Option<u16>,
    /// Outbound proxy for upstream calls.
    #[arg(long, env = "RELAY_PROXY")]
    pub(crate) proxy: Option<String>,
    #[arg(long, env = "RELAY_RETRY_TIMES")]
    pub(crate) retry_times: Option<u32>,
}

impl Cli {
    /// The command-line layer; clap has already folded the environment in.
    pub(crate) fn patch(&self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host.clone(),
            port: self.port,
            proxy: self.proxy.clone(),
            retry_times: self.retry_times,
            ..GlobalConfigPatch::default()
        }
    }
}
