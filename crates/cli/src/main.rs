use anyhow::Result;
use clap::Parser;

use unipubsub_infra::RedisConfig;

mod cli;
mod listen;
mod publish;

use cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();
    unipubsub_observability::init();

    let redis = RedisConfig {
        url: cli.redis_url.clone(),
        ..RedisConfig::from_env()
    };

    match cli.command {
        Command::Listen(args) => listen::run(redis, cli.mode, args),
        Command::Publish(args) => publish::run(redis, cli.mode, args),
    }
}
