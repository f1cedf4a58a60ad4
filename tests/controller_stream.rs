// tests/controller_stream.rs

mod common;

use std::error::Error;
use std::fs;
use std::sync::Arc;

use common::{event_writer, parse_envelopes, sample_row, suite_with, BlockingStep};
use mailfleet::config::AppConfig;
use mailfleet::engine::{Controller, RunLogger};
use mailfleet::exec::production_suite;
use mailfleet::mask::Masker;
use mailfleet::protocol::{
    CommandReader, EventType, LogLineEvent, RunFinishedEvent, RunStartedEvent, StartRunCommand,
    Step,
};
use tokio::io::BufReader;

type TestResult = Result<(), Box<dyn Error>>;

const HEADER: &str = "row_id,cf_api_token,cf_zone,server_ip,server_port,server_user,server_password,server_key_path,host,domain,deploy_profile,email_use,solution";

fn csv_line(row_id: i64) -> String {
    let row = sample_row(row_id);
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{}",
        row.row_id,
        row.cf_api_token,
        row.cf_zone,
        row.server_ip,
        row.server_port,
        row.server_user,
        row.server_password,
        row.server_key_path,
        row.host,
        row.domain,
        row.deploy_profile,
        row.email_use,
        row.solution
    )
}

fn write_fleet(dir: &std::path::Path, rows: &[i64]) -> std::path::PathBuf {
    let path = dir.join("fleet.csv");
    let mut contents = String::from(HEADER);
    contents.push('\n');
    for row_id in rows {
        contents.push_str(&csv_line(*row_id));
        contents.push('\n');
    }
    fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn run_once_completes_a_dry_run_deployment() -> TestResult {
    let dir = tempfile::tempdir()?;
    let fleet = write_fleet(dir.path(), &[1, 2]);

    let (events, buf) = event_writer();
    let masker = Arc::new(Masker::new());
    let logger = Arc::new(RunLogger::new(Arc::clone(&events), Arc::clone(&masker)));

    let mut controller = Controller::new(
        AppConfig::default(),
        dir.path().join("output"),
        events,
        logger,
        masker,
        Arc::new(production_suite()),
    );

    controller
        .run_once(StartRunCommand {
            run_id: Some("run-1700000000-99".into()),
            config_path: fleet.display().to_string(),
            concurrency: 2,
            dns_dry_run: false,
            dry_run: true,
        })
        .await?;

    let envelopes = parse_envelopes(&buf);

    let started: Vec<RunStartedEvent> = envelopes
        .iter()
        .filter(|env| env.event_type == EventType::RunStarted)
        .map(|env| serde_json::from_value(env.data.clone().unwrap()).unwrap())
        .collect();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].total_tasks, 2);
    assert_eq!(started[0].concurrency, 2);
    assert!(started[0].dry_run);

    let finished: Vec<RunFinishedEvent> = envelopes
        .iter()
        .filter(|env| env.event_type == EventType::RunFinished)
        .map(|env| serde_json::from_value(env.data.clone().unwrap()).unwrap())
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, "COMPLETED");
    assert_eq!(finished[0].success, 2);
    assert_eq!(finished[0].failed, 0);
    assert!(finished[0].outputs.contains_key("report_dir"));

    // RUN_STARTED precedes all task events; RUN_FINISHED follows them.
    let first = envelopes
        .iter()
        .position(|env| env.event_type == EventType::RunStarted)
        .unwrap();
    let last = envelopes
        .iter()
        .position(|env| env.event_type == EventType::RunFinished)
        .unwrap();
    for (index, envelope) in envelopes.iter().enumerate() {
        if matches!(envelope.event_type, EventType::TaskState | EventType::TaskStep) {
            assert!(index > first && index < last);
        }
    }

    // Reports were written for both rows.
    for row_id in [1, 2] {
        assert!(dir
            .path()
            .join(format!("output/reports/run-1700000000-99/{row_id}.json"))
            .exists());
    }

    Ok(())
}

#[tokio::test]
async fn event_stream_rejects_second_start_run_and_cancels_on_eof() -> TestResult {
    let dir = tempfile::tempdir()?;
    let fleet = write_fleet(dir.path(), &[1]);

    let (events, buf) = event_writer();
    let masker = Arc::new(Masker::new());
    let logger = Arc::new(RunLogger::new(Arc::clone(&events), Arc::clone(&masker)));

    // A suite that parks the task so the run is still live when the second
    // START_RUN and then EOF arrive.
    let blocking = Arc::new(BlockingStep::new());
    let suite = suite_with(Step::ServerPrepare, blocking);

    let mut controller = Controller::new(
        AppConfig::default(),
        dir.path().join("output"),
        events,
        logger,
        masker,
        Arc::new(suite),
    );

    let start = format!(
        "{{\"type\":\"START_RUN\",\"config_path\":\"{}\",\"concurrency\":1}}\n",
        fleet.display()
    );
    let input = format!("{start}{start}{{\"type\":\"PING\"}}\n");
    let commands = CommandReader::new(BufReader::new(std::io::Cursor::new(input.into_bytes())));

    controller.run_event_stream(commands).await?;

    let envelopes = parse_envelopes(&buf);

    // Only one run was started.
    let started = envelopes
        .iter()
        .filter(|env| env.event_type == EventType::RunStarted)
        .count();
    assert_eq!(started, 1);

    // The rejection was logged.
    let logs: Vec<LogLineEvent> = envelopes
        .iter()
        .filter(|env| env.event_type == EventType::LogLine)
        .map(|env| serde_json::from_value(env.data.clone().unwrap()).unwrap())
        .collect();
    assert!(logs
        .iter()
        .any(|line| line.message.contains("already active")));

    // EOF shut the run down cleanly: exactly one RUN_FINISHED, counters
    // balanced.
    let finished: Vec<RunFinishedEvent> = envelopes
        .iter()
        .filter(|env| env.event_type == EventType::RunFinished)
        .map(|env| serde_json::from_value(env.data.clone().unwrap()).unwrap())
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(
        finished[0].success + finished[0].failed + finished[0].cancelled,
        1
    );

    Ok(())
}

#[tokio::test]
async fn start_run_with_missing_fleet_emits_invalid_config() -> TestResult {
    let dir = tempfile::tempdir()?;

    let (events, buf) = event_writer();
    let masker = Arc::new(Masker::new());
    let logger = Arc::new(RunLogger::new(Arc::clone(&events), Arc::clone(&masker)));

    let mut controller = Controller::new(
        AppConfig::default(),
        dir.path().join("output"),
        events,
        logger,
        masker,
        Arc::new(production_suite()),
    );

    controller
        .run_once(StartRunCommand {
            run_id: None,
            config_path: dir.path().join("nope.csv").display().to_string(),
            concurrency: 1,
            dns_dry_run: false,
            dry_run: true,
        })
        .await?;

    let envelopes = parse_envelopes(&buf);
    assert!(envelopes
        .iter()
        .any(|env| env.event_type == EventType::Error));
    assert!(!envelopes
        .iter()
        .any(|env| env.event_type == EventType::RunStarted));

    Ok(())
}
