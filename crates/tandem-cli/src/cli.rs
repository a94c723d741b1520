use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tandem",
    about = "Tandem: CRDT stores and proxies over pluggable storage drivers",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Shorthand for `--format json`
    #[arg(long, global = true)]
    pub json: bool,

    /// Store configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn output(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            self.format
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a synchronization scenario against in-memory drivers
    Simulate(SimulateArgs),
    /// Parse a storage key and describe its shape
    Key(KeyArgs),
}

#[derive(Args)]
pub struct SimulateArgs {
    pub scenario: Scenario,
}

#[derive(Args)]
pub struct KeyArgs {
    /// A key such as `volatile://people` or
    /// `reference-mode://{volatile://b}{volatile://c}`
    pub key: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// One client writes a singleton, another reads it back
    Roundtrip,
    /// Two unaware clients add to the same reference-mode collection
    ConcurrentAdd,
    /// A container reference arrives before its backing entity
    BackingRace,
    /// A proxy receives operations it cannot apply and resyncs
    ForcedDesync,
}

impl Scenario {
    pub fn name(self) -> &'static str {
        match self {
            Scenario::Roundtrip => "roundtrip",
            Scenario::ConcurrentAdd => "concurrent-add",
            Scenario::BackingRace => "backing-race",
            Scenario::ForcedDesync => "forced-desync",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_overrides_format() {
        let cli = Cli::parse_from(["tandem", "--json", "simulate", "roundtrip"]);
        assert_eq!(cli.output(), OutputFormat::Json);
        let cli = Cli::parse_from(["tandem", "key", "volatile://x"]);
        assert_eq!(cli.output(), OutputFormat::Text);
        assert!(cli.config.is_none());
    }

    #[test]
    fn scenarios_parse_in_kebab_case() {
        let cli = Cli::parse_from([
            "tandem",
            "simulate",
            "forced-desync",
            "--config",
            "tandem.toml",
        ]);
        match cli.command {
            Command::Simulate(args) => assert_eq!(args.scenario, Scenario::ForcedDesync),
            Command::Key(_) => panic!("expected simulate"),
        }
        assert_eq!(cli.config, Some(PathBuf::from("tandem.toml")));
    }
}
