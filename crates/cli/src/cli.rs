use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use unipubsub_infra::backend::redis::DEFAULT_REDIS_URL;

#[derive(Parser, Debug)]
#[command(name = "unipubsub")]
#[command(
    author,
    version,
    about = "Publish to and consume from Redis channels or streams",
    long_about = None
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Redis connection URL
    #[arg(long, global = true, env = "UNIPUBSUB_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Delivery semantics: pub/sub channels or streams
    #[arg(long, global = true, value_enum, env = "UNIPUBSUB_MODE", default_value_t = Mode::Log)]
    pub mode: Mode,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Broadcast,
    Log,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume topics until interrupted, then checkpoint
    Listen(ListenArgs),

    /// Publish one event
    Publish(PublishArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ListenArgs {
    /// Topic to consume (repeatable)
    #[arg(short, long = "topic", required = true)]
    pub topics: Vec<String>,

    /// Checkpoint file, loaded on start and written on shutdown
    #[arg(long, env = "UNIPUBSUB_CHECKPOINT")]
    pub checkpoint: Option<PathBuf>,

    /// Read log topics from the first entry instead of only new ones
    #[arg(long)]
    pub from_start: bool,

    /// Stop after this many events
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Route only these actions; other events are reported as unhandled
    #[arg(long = "action")]
    pub actions: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    #[arg(short, long)]
    pub topic: String,

    #[arg(short, long)]
    pub action: String,

    #[arg(long, default_value_t = 0)]
    pub ttl: i64,

    /// A JSON object is sent as a structured payload, anything else as text
    #[arg(short, long)]
    pub payload: Option<String>,

    /// Explicit entry id (log mode only)
    #[arg(long)]
    pub entry_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_listen() {
        let cli = Cli::parse_from([
            "unipubsub", "--mode", "broadcast", "listen", "-t", "a", "-t", "b", "--max-events", "3",
        ]);
        assert_eq!(cli.mode, Mode::Broadcast);
        match cli.command {
            Command::Listen(args) => {
                assert_eq!(args.topics, vec!["a", "b"]);
                assert_eq!(args.max_events, Some(3));
                assert!(!args.from_start);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
