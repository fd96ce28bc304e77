use anyhow::Result;
use argp::FromArgs;
use diffcast_core::{config::Config, video::Stage};

use crate::util::{open_orchestrator, print_json, stage};

#[derive(FromArgs, PartialEq, Debug)]
/// Run one stage in isolation and print its output. Nothing is persisted.
#[argp(subcommand, name = "test-stage")]
pub struct Args {
    #[argp(positional)]
    /// commit id (owner_repo_sha7)
    commit_id: String,
    #[argp(positional, from_str_fn(stage))]
    /// stage to run (goal, demo, script, snapshots, clipgen, stitch, voice, captions, finalize)
    stage: Stage,
    #[argp(option, short = 'l')]
    /// language for voice, captions and finalize
    language: Option<String>,
}

pub async fn run(args: Args, config: &Config) -> Result<()> {
    let (orchestrator, db) = open_orchestrator(config).await?;
    let result =
        orchestrator.test_stage(&args.commit_id, args.stage, args.language.as_deref()).await;
    db.close().await;
    print_json(&result?)
}
