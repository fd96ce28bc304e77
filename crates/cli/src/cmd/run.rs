use anyhow::{Context, Result};
use argp::FromArgs;
use diffcast_core::{config::Config, video::Stage};
use diffcast_pipeline::{RunOutcome, TriggerRequest};

use crate::util::{open_orchestrator, print_json, stage};

#[derive(FromArgs, PartialEq, Debug)]
/// Trigger a pipeline run and drive it to completion in this process.
#[argp(subcommand, name = "run")]
pub struct Args {
    #[argp(positional)]
    /// commit id (owner_repo_sha7)
    commit_id: String,
    #[argp(option, short = 'l')]
    /// language to produce (repeatable; defaults to the configured set)
    language: Vec<String>,
    #[argp(switch, short = 'f')]
    /// re-run even if the record already completed
    force: bool,
    #[argp(option, from_str_fn(stage))]
    /// replay from this stage onward (implies --force)
    from: Option<Stage>,
}

pub async fn run(args: Args, config: &Config) -> Result<()> {
    let (orchestrator, db) = open_orchestrator(config).await?;
    let request = TriggerRequest {
        commit_id: args.commit_id,
        languages: (!args.language.is_empty()).then_some(args.language),
        force: args.force,
        from_stage: args.from,
    };
    let result = async {
        let ticket = orchestrator.trigger(&request).await?;
        tracing::info!(video_id = %ticket.video_id, "Trigger: {}", ticket.outcome.as_str());
        if let (RunOutcome::Started, Some(run_id)) = (ticket.outcome, &ticket.run_id) {
            orchestrator.execute(&ticket.video_id, run_id).await?;
        }
        orchestrator.status(&ticket.video_id).await
    }
    .await
    .context("Pipeline run failed");
    db.close().await;
    print_json(&result?)
}
