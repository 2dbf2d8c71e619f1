//! fanout-ctl: send files to fanout receivers and rebuild them afterwards.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod progress;

#[derive(Parser, Debug)]
#[command(name = "fanout-ctl", version, about = "Chunked file distribution over TCP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a file and deliver its chunks to receiver nodes
    Send(cmd::send::SendArgs),
    /// Rebuild files from a chunk directory
    Assemble(cmd::assemble::AssembleArgs),
    /// Probe receiver nodes for readiness
    Health(cmd::health::HealthArgs),
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let ok = match cli.command {
        Command::Send(args) => cmd::send::run(args).await?,
        Command::Assemble(args) => cmd::assemble::run(args).await?,
        Command::Health(args) => cmd::health::run(args).await?,
    };
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn send_takes_comma_separated_nodes() {
        let cli = Cli::try_parse_from([
            "fanout-ctl", "send", "movie.mkv", "--nodes", "a:1,b:2", "--workers", "3",
        ])
        .unwrap();
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.file, PathBuf::from("movie.mkv"));
        assert_eq!(args.nodes, vec!["a:1", "b:2"]);
        assert_eq!(args.workers, Some(3));
        assert_eq!(args.chunk_size, None);
    }

    #[test]
    fn assemble_takes_dir_and_prefix() {
        let cli = Cli::try_parse_from(["fanout-ctl", "assemble", "./chunks", "out/restored"]).unwrap();
        let Command::Assemble(args) = cli.command else {
            panic!("expected assemble");
        };
        assert_eq!(args.chunk_dir, PathBuf::from("./chunks"));
        assert_eq!(args.output_prefix, PathBuf::from("out/restored"));
    }

    #[test]
    fn send_requires_a_file() {
        assert!(Cli::try_parse_from(["fanout-ctl", "send", "--nodes", "a:1"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
