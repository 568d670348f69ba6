use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "weft",
    about = "Weft: task-chain orchestration over a non-blocking object store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a scenario against the in-memory store
    Demo(DemoArgs),
    /// Inspect connector configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct DemoArgs {
    #[command(subcommand)]
    pub scenario: Scenario,
}

#[derive(Subcommand)]
pub enum Scenario {
    /// Open a container and query its pool
    Connect(ConnectArgs),
    /// Allocate object indices, optionally collectively across participants
    Alloc(AllocArgs),
    /// Write keys into a group and list them page by page
    List(ListArgs),
}

#[derive(Args)]
pub struct ConnectArgs {
    #[arg(long, default_value = "demo")]
    pub label: String,
}

#[derive(Args)]
pub struct AllocArgs {
    #[arg(short = 'n', long, default_value = "8")]
    pub count: usize,
    #[arg(short, long, default_value = "1")]
    pub participants: usize,
    /// Allocate from each participant's own lease instead of the shared one
    #[arg(long)]
    pub independent: bool,
}

#[derive(Args)]
pub struct ListArgs {
    #[arg(long, default_value = "20")]
    pub keys: usize,
    #[arg(long, default_value = "4")]
    pub page: usize,
    /// Stop after this many keys
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// TOML file to load before applying WEFT_* overrides
        #[arg(long)]
        file: Option<PathBuf>,
    },
}
