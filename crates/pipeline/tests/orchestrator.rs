mod common;

use std::{
    str::FromStr,
    time::{Duration, Instant},
};

use common::{COMMIT_ID, Harness};
use diffcast_core::{
    models::DemoStatus,
    video::{PipelineStatus, Stage, TrackStatus, Video},
};
use diffcast_pipeline::{PipelineError, RunOutcome, StageOutput, TriggerRequest};

fn request(languages: Option<&[&str]>) -> TriggerRequest {
    TriggerRequest {
        commit_id: COMMIT_ID.to_string(),
        languages: languages.map(|l| l.iter().map(|s| s.to_string()).collect()),
        ..Default::default()
    }
}

async fn run(h: &Harness, request: &TriggerRequest) -> Video {
    let ticket = h.orchestrator.trigger(request).await.unwrap();
    assert_eq!(ticket.outcome, RunOutcome::Started);
    let run_id = ticket.run_id.unwrap();
    h.orchestrator.execute(&ticket.video_id, &run_id).await.unwrap().unwrap()
}

async fn stored(h: &Harness) -> Video { h.records.get_video(COMMIT_ID).await.unwrap().unwrap() }

#[tokio::test]
async fn test_full_run() {
    let h = Harness::new(&["en", "es"]).await;
    let video = run(&h, &request(None)).await;

    assert_eq!(video.status, PipelineStatus::Completed);
    assert_eq!(video.stage, Stage::Done);
    assert_eq!(video.languages, ["en", "es"]);
    assert!(video.run.is_none());
    assert!(video.completed_at.is_some());
    assert_eq!(video.goal.as_deref(), Some("Turn on dark mode from the settings page"));
    assert_eq!(video.frames.as_ref().map(Vec::len), Some(3));
    assert_eq!(video.clips.as_ref().map(Vec::len), Some(2));
    // 20s demo plus a 4s opener and a 6s closer
    assert_eq!(video.base_video.as_ref().map(|b| b.duration_sec), Some(30.0));

    let en = &video.tracks["en"];
    assert_eq!(en.status, TrackStatus::Completed);
    assert_eq!(en.narration, ["Open the settings page.", "Choose the dark theme."]);
    assert_eq!(en.final_video.as_deref(), Some("videos/octo_hello_abc1234/tracks/en/final.mp4"));
    let es = &video.tracks["es"];
    assert_eq!(es.status, TrackStatus::Completed);
    assert!(es.narration.iter().all(|l| l.starts_with("[es] ")));
    assert_eq!(h.fake.calls("translate:en"), 0);
    assert_eq!(h.fake.calls("translate:es"), 1);

    // The in-memory view matches what was persisted.
    let persisted = stored(&h).await;
    assert_eq!(persisted.tracks, video.tracks);
    assert_eq!(persisted.status, video.status);

    let commit = h.records.get_commit(COMMIT_ID).await.unwrap().unwrap();
    assert_eq!(commit.demo_goal, video.goal);
    assert_eq!(commit.demo.map(|d| d.status), Some(DemoStatus::Completed));
}

#[tokio::test]
async fn test_stages_advance_monotonically() {
    let h = Harness::new(&["en", "fr"]).await;
    run(&h, &request(None)).await;

    let stages = h.store.stages();
    assert_eq!(stages, [
        "queued",
        "goal",
        "demo",
        "script",
        "snapshots",
        "clipgen",
        "stitch",
        "voice",
        "captions",
        "finalize",
        "done"
    ]);
    let parsed = stages.iter().map(|s| Stage::from_str(s).unwrap()).collect::<Vec<_>>();
    assert!(parsed.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_resume_skips_completed_stages() {
    let h = Harness::new(&["en"]).await;
    h.fake.fail("clipgen", "clip service rejected the prompt");
    let failed = run(&h, &request(None)).await;
    assert_eq!(failed.status, PipelineStatus::Failed);
    assert_eq!(failed.stage, Stage::Clipgen);
    assert!(failed.error.as_deref().unwrap().contains("clip service rejected the prompt"));
    assert!(failed.run.is_none());

    h.fake.heal();
    h.fake.reset_calls();
    h.store.reset_stages();
    let video = run(&h, &request(None)).await;

    assert_eq!(video.status, PipelineStatus::Completed);
    for key in ["goal", "demo", "script", "snapshots"] {
        assert_eq!(h.fake.calls(key), 0, "{key} should not run again");
    }
    assert_eq!(h.fake.calls("clipgen"), 2);
    assert_eq!(h.fake.calls("stitch"), 1);
    assert_eq!(video.goal, failed.goal);
    assert_eq!(video.demo, failed.demo);
    assert_eq!(video.script, failed.script);
    assert_eq!(video.frames, failed.frames);
    assert!(video.error.is_none());
    assert!(!h.store.stages().iter().any(|s| s == "goal" || s == "script"));
}

#[tokio::test]
async fn test_completed_record_is_not_rerun() {
    let h = Harness::new(&["en"]).await;
    run(&h, &request(None)).await;
    h.fake.reset_calls();

    let ticket = h.orchestrator.trigger(&request(None)).await.unwrap();
    assert_eq!(ticket.outcome, RunOutcome::AlreadyCompleted);
    assert!(ticket.run_id.is_none());
    assert_eq!(h.fake.total_calls(), 0);
}

#[tokio::test]
async fn test_forced_replay_from_script() {
    let h = Harness::new(&["en"]).await;
    let before = run(&h, &request(None)).await;
    h.fake.reset_calls();

    let mut replay = request(None);
    replay.from_stage = Some(Stage::Script);
    let video = run(&h, &replay).await;

    assert_eq!(video.status, PipelineStatus::Completed);
    assert_eq!(h.fake.calls("goal"), 0);
    assert_eq!(h.fake.calls("demo"), 0);
    assert_eq!(h.fake.calls("script"), 1);
    assert_eq!(h.fake.calls("snapshots"), 1);
    assert_eq!(h.fake.calls("clipgen"), 2);
    assert_eq!(h.fake.calls("stitch"), 1);
    assert_eq!(h.fake.calls("voice:en"), 1);
    assert_eq!(video.goal, before.goal);
    assert_eq!(video.demo, before.demo);
    assert!(video.tracks["en"].finished_at >= before.tracks["en"].finished_at);
}

#[tokio::test]
async fn test_language_failure_is_isolated() {
    let h = Harness::new(&["en", "fr"]).await;
    h.fake.fail("voice:fr", "voice quota exhausted");
    let video = run(&h, &request(None)).await;

    assert_eq!(video.status, PipelineStatus::Completed);
    assert_eq!(video.stage, Stage::Done);
    let fr = &video.tracks["fr"];
    assert_eq!(fr.status, TrackStatus::Failed);
    assert_eq!(fr.failed_stage, Some(Stage::Voice));
    assert_eq!(fr.error.as_deref(), Some("voice quota exhausted"));
    assert!(fr.final_video.is_none());
    let en = &video.tracks["en"];
    assert_eq!(en.status, TrackStatus::Completed);
    assert_eq!(h.fake.calls("finalize:en"), 1);
    assert_eq!(h.fake.calls("captions:fr"), 0);
    assert_eq!(h.fake.calls("finalize:fr"), 0);

    let status = h.orchestrator.status(COMMIT_ID).await.unwrap();
    assert_eq!(status.tracks["fr"].status, TrackStatus::Failed);
    assert_eq!(status.progress, 1.0);
}

#[tokio::test]
async fn test_failed_language_is_retried_on_next_trigger() {
    let h = Harness::new(&["en", "fr"]).await;
    h.fake.fail("captions:fr", "caption writer crashed");
    let first = run(&h, &request(None)).await;
    assert_eq!(first.tracks["fr"].failed_stage, Some(Stage::Captions));
    assert_eq!(first.status, PipelineStatus::Completed);

    h.fake.heal();
    h.fake.reset_calls();
    let video = run(&h, &request(None)).await;
    assert_eq!(video.tracks["fr"].status, TrackStatus::Completed);
    assert_eq!(video.tracks["en"], first.tracks["en"]);
    assert_eq!(h.fake.calls("voice:en"), 0);
    assert_eq!(h.fake.calls("voice:fr"), 1);
}

#[tokio::test]
async fn test_default_language_failure_fails_record() {
    let h = Harness::new(&["en", "es"]).await;
    h.fake.fail("voice:en", "speech service refused the text");
    let video = run(&h, &request(None)).await;

    assert_eq!(video.status, PipelineStatus::Failed);
    assert_eq!(video.stage, Stage::Voice);
    assert_eq!(
        video.error.as_deref(),
        Some("default language track failed: speech service refused the text")
    );
    assert_eq!(video.tracks["es"].status, TrackStatus::Completed);
    assert!(video.run.is_none());
}

#[tokio::test]
async fn test_missing_website_url_fails_at_demo() {
    let h = Harness::with_website(&["en"], None).await;
    let video = run(&h, &request(None)).await;

    assert_eq!(video.status, PipelineStatus::Failed);
    assert_eq!(video.stage, Stage::Demo);
    let error = video.error.as_deref().unwrap();
    assert!(error.contains("no website URL"), "{error}");
    assert!(video.goal.is_some());
    assert!(video.demo.is_none());
    assert_eq!(h.fake.calls("demo"), 0);

    let commit = h.records.get_commit(COMMIT_ID).await.unwrap().unwrap();
    let demo = commit.demo.unwrap();
    assert_eq!(demo.status, DemoStatus::Failed);
    assert!(demo.error.unwrap().contains("no website URL"));
}

#[tokio::test]
async fn test_forced_retrigger_keeps_other_tracks() {
    let h = Harness::new(&["en", "es"]).await;
    let before = run(&h, &request(None)).await;
    h.fake.reset_calls();

    let mut retrigger = request(Some(&["en"]));
    retrigger.force = true;
    let video = run(&h, &retrigger).await;

    assert_eq!(video.status, PipelineStatus::Completed);
    assert_eq!(video.languages, ["en"]);
    assert_eq!(video.tracks["es"], before.tracks["es"]);
    assert_eq!(h.fake.calls("voice:en"), 1);
    assert_eq!(h.fake.calls("voice:es"), 0);
    assert_eq!(stored(&h).await.tracks["es"], before.tracks["es"]);
}

#[tokio::test]
async fn test_test_stage_does_not_write() {
    let h = Harness::new(&["en"]).await;
    h.fake.fail("script", "model overloaded");
    run(&h, &request(None)).await;
    h.fake.heal();
    let before = stored(&h).await;
    assert!(before.demo.is_some());
    assert!(before.script.is_none());
    h.store.reset_stages();

    let output = h.orchestrator.test_stage(COMMIT_ID, Stage::Script, None).await.unwrap();
    let StageOutput::Script { script } = output else {
        panic!("expected a script output");
    };
    assert_eq!(script.scenes.len(), 2);
    assert_eq!(script.total_duration_sec, 20.0);

    assert_eq!(stored(&h).await, before);
    assert!(h.store.stages().is_empty());
}

#[tokio::test]
async fn test_test_stage_for_language() {
    let h = Harness::new(&["en", "es"]).await;
    run(&h, &request(None)).await;
    let before = stored(&h).await;

    let output = h.orchestrator.test_stage(COMMIT_ID, Stage::Voice, Some("ES")).await.unwrap();
    let StageOutput::Voice { language, narration, .. } = output else {
        panic!("expected a voice output");
    };
    assert_eq!(language, "es");
    assert!(narration.iter().all(|l| l.starts_with("[es] ")));
    // once during the run, once for the isolated stage; nothing downstream
    assert_eq!(h.fake.calls("voice:es"), 2);
    assert_eq!(h.fake.calls("captions:es"), 1);
    assert_eq!(stored(&h).await, before);

    let err = h.orchestrator.test_stage(COMMIT_ID, Stage::Done, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_duplicate_trigger_is_a_no_op() {
    let h = Harness::new(&["en"]).await;
    let first = h.orchestrator.trigger(&request(None)).await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Started);

    let second = h.orchestrator.trigger(&request(None)).await.unwrap();
    assert_eq!(second.outcome, RunOutcome::AlreadyInProgress);
    assert_eq!(second.run_id, first.run_id);

    let mut forced = request(None);
    forced.force = true;
    let third = h.orchestrator.trigger(&forced).await.unwrap();
    assert_eq!(third.outcome, RunOutcome::AlreadyInProgress);
    assert_eq!(h.fake.total_calls(), 0);

    let video =
        h.orchestrator.execute(&first.video_id, first.run_id.as_deref().unwrap()).await.unwrap();
    assert_eq!(video.map(|v| v.status), Some(PipelineStatus::Completed));
}

#[tokio::test]
async fn test_superseded_run_stops() {
    let h = Harness::new(&["en"]).await;
    let stale = h.orchestrator.trigger(&request(None)).await.unwrap();

    assert!(h.orchestrator.recover_runs(false).await.unwrap().is_empty());
    let recovered = h.orchestrator.recover_runs(true).await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_ne!(recovered[0].run_id, stale.run_id);

    let result =
        h.orchestrator.execute(&stale.video_id, stale.run_id.as_deref().unwrap()).await.unwrap();
    assert!(result.is_none());
    assert_eq!(h.fake.total_calls(), 0);

    let fresh = &recovered[0];
    let video =
        h.orchestrator.execute(&fresh.video_id, fresh.run_id.as_deref().unwrap()).await.unwrap();
    assert_eq!(video.map(|v| v.status), Some(PipelineStatus::Completed));
}

#[tokio::test]
async fn test_status_projection_is_pure() {
    let h = Harness::new(&["en"]).await;
    run(&h, &request(None)).await;
    let first = h.orchestrator.status(COMMIT_ID).await.unwrap();
    let second = h.orchestrator.status(COMMIT_ID).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.status, PipelineStatus::Completed);
    assert_eq!(first.title.as_deref(), Some("Dark mode"));
    assert_eq!(first.demo, Some(DemoStatus::Completed));
}

#[tokio::test]
async fn test_trigger_rejections() {
    let h = Harness::new(&["en"]).await;

    let mut unknown = request(None);
    unknown.commit_id = "octo_hello_fffffff".to_string();
    let err = h.orchestrator.trigger(&unknown).await.unwrap_err();
    assert!(matches!(err, PipelineError::CommitNotFound(_)));

    let err = h.orchestrator.trigger(&request(Some(&["english!"]))).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));

    let mut done = request(None);
    done.from_stage = Some(Stage::Done);
    let err = h.orchestrator.trigger(&done).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));

    let err = h.orchestrator.status("octo_hello_fffffff").await.unwrap_err();
    assert!(matches!(err, PipelineError::VideoNotFound(_)));
}

#[tokio::test]
async fn test_slow_stage_keeps_its_claim() {
    let h = Harness::with_config(&["en"], |c| c.stale_after_secs = 1).await;
    h.fake.delay("clipgen", Duration::from_millis(1200));
    let ticket = h.orchestrator.trigger(&request(None)).await.unwrap();
    let run_id = ticket.run_id.clone().unwrap();

    // Sweep while the second clip is still generating, long after the
    // stage was entered.
    let sweep = async {
        tokio::time::sleep(Duration::from_millis(1800)).await;
        h.orchestrator.recover_runs(false).await.unwrap()
    };
    let (video, recovered) = tokio::join!(h.orchestrator.execute(&ticket.video_id, &run_id), sweep);

    assert!(recovered.is_empty());
    let video = video.unwrap().unwrap();
    assert_eq!(video.status, PipelineStatus::Completed);
    assert_eq!(h.fake.calls("clipgen"), 2);
}

#[tokio::test]
async fn test_run_taken_over_mid_stage_discards_its_output() {
    let h = Harness::with_config(&["en"], |c| c.stale_after_secs = 1).await;
    h.fake.delay("clipgen", Duration::from_millis(1000));
    let first = h.orchestrator.trigger(&request(None)).await.unwrap();
    let first_run = first.run_id.clone().unwrap();

    let takeover = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.orchestrator.recover_runs(true).await.unwrap()
    };
    let (result, recovered) =
        tokio::join!(h.orchestrator.execute(&first.video_id, &first_run), takeover);

    // The old run noticed at its next heartbeat and dropped the clip in flight.
    assert!(result.unwrap().is_none());
    assert_eq!(h.fake.calls("clipgen"), 1);
    let persisted = stored(&h).await;
    assert!(persisted.clips.is_none());
    assert_eq!(persisted.run.map(|r| r.id), recovered[0].run_id);

    h.fake.delay("clipgen", Duration::ZERO);
    let fresh = &recovered[0];
    let video =
        h.orchestrator.execute(&fresh.video_id, fresh.run_id.as_deref().unwrap()).await.unwrap();
    let video = video.unwrap();
    assert_eq!(video.status, PipelineStatus::Completed);
    assert_eq!(video.clips.as_ref().map(Vec::len), Some(2));
    assert_eq!(h.fake.calls("clipgen"), 3);
}

#[tokio::test]
async fn test_store_outage_stops_run_without_advancing() {
    let h = Harness::new(&["en"]).await;
    h.store.fail_at("script");
    let ticket = h.orchestrator.trigger(&request(None)).await.unwrap();
    let run_id = ticket.run_id.clone().unwrap();

    let err = h.orchestrator.execute(&ticket.video_id, &run_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Store(_)), "{err}");
    let persisted = stored(&h).await;
    assert_eq!(persisted.status, PipelineStatus::Running);
    assert_eq!(persisted.stage, Stage::Demo);
    assert!(persisted.demo.is_some());
    assert!(persisted.script.is_none());
    assert_eq!(persisted.run.map(|r| r.id), Some(run_id.clone()));
    assert_eq!(h.fake.calls("script"), 0);

    // The claim survives, so retrying the same run picks up where it stopped.
    h.store.recover();
    h.fake.reset_calls();
    let video = h.orchestrator.execute(&ticket.video_id, &run_id).await.unwrap().unwrap();
    assert_eq!(video.status, PipelineStatus::Completed);
    assert_eq!(h.fake.calls("goal"), 0);
    assert_eq!(h.fake.calls("demo"), 0);
    assert_eq!(h.fake.calls("script"), 1);
}

#[tokio::test]
async fn test_languages_run_concurrently() {
    let h = Harness::new(&["en", "fr"]).await;
    h.fake.delay("voice:en", Duration::from_millis(300));
    h.fake.delay("voice:fr", Duration::from_millis(600));

    let started = Instant::now();
    let video = run(&h, &request(None)).await;
    let elapsed = started.elapsed();

    assert_eq!(video.status, PipelineStatus::Completed);
    let (en, fr) = (&video.tracks["en"], &video.tracks["fr"]);
    assert_eq!(en.status, TrackStatus::Completed);
    assert_eq!(fr.status, TrackStatus::Completed);
    // English does not wait for the slower French voice before moving on.
    assert!(en.finished_at < fr.finished_at);
    assert!(elapsed >= Duration::from_millis(600));
    assert!(elapsed < Duration::from_millis(850), "took {elapsed:?}");
}
