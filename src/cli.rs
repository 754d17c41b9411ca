use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tileadder",
    version,
    about = "Admin server for registering FITS tile datasets"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
    #[arg(long)]
    pub static_root: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
    /// Apply pending schema migrations before serving.
    #[arg(long, default_value_t = false)]
    pub migrate: bool,
}
