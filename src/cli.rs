use clap::Parser;
use std::path::PathBuf;

// Build version with API/target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "API:    loopback HTTP, token-authenticated\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Out-of-process media encode worker
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// TCP port for the loopback control API
    #[arg(long = "port", value_name = "N", default_value_t = 8037)]
    pub port: u16,

    /// Pre-register the shared-secret token at startup
    #[arg(long = "token", value_name = "SECRET")]
    pub token: Option<String>,

    /// Enable debug logging to file (default: encoderd.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}
