use anyhow::Result;
use argp::FromArgs;
use diffcast_core::config::Config;

use crate::util::{open_orchestrator, print_json};

#[derive(FromArgs, PartialEq, Debug)]
/// Print the status of a pipeline record.
#[argp(subcommand, name = "status")]
pub struct Args {
    #[argp(positional)]
    /// pipeline record id (same as the commit id)
    video_id: String,
}

pub async fn run(args: Args, config: &Config) -> Result<()> {
    let (orchestrator, db) = open_orchestrator(config).await?;
    let result = orchestrator.status(&args.video_id).await;
    db.close().await;
    print_json(&result?)
}
