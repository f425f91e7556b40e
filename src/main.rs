use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use assessflow::api::{AssessmentApi, HttpAssessmentApi};
use assessflow::cli::{Cli, Command};
use assessflow::config::AssessflowConfig;
use assessflow::ledger::{HttpTokenLedger, InMemoryLedger, TokenLedger};
use assessflow::monitor::{LocalNotifier, WsPushConnector};
use assessflow::orchestrator::{Workflow, WorkflowDeps};
use assessflow::sim::{SimOutcome, SimPlan, SimulatedAssessmentApi};
use assessflow::state_machine::{AuditRecord, SubmissionRequest, WorkflowState};
use assessflow::ui::{self, TerminalObserver};

const DEMO_TOKEN: &str = "demo-token";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "assessflow=debug" } else { "assessflow=warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();

    let config = AssessflowConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Submit { label, scores, key } => submit(&config, label, &scores, key).await,
        Command::Status { job_id } => {
            let api = HttpAssessmentApi::new(
                config.api_url.clone(),
                config.api_token.clone(),
                config.request_timeout(),
            )?;
            let status = api.status(&job_id).await?;
            ui::print_status(&job_id, &status);
            Ok(())
        }
        Command::Balance => {
            let ledger = HttpTokenLedger::new(
                config.ledger_url.clone(),
                config.api_token.clone(),
                config.ledger_timeout(),
            )?;
            println!("{} tokens", ledger.balance().await?);
            Ok(())
        }
        Command::Demo {
            balance,
            fail,
            cancel,
        } => demo(&config, balance, fail, cancel).await,
    }
}

fn read_scores(path: &Path) -> Result<BTreeMap<String, f64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON object of scores", path.display()))
}

async fn submit(config: &AssessflowConfig, label: String, scores: &Path, key: Option<String>) -> Result<()> {
    let scores = read_scores(scores)?;
    let request = match key {
        Some(key) => SubmissionRequest::with_key(key, label, scores),
        None => SubmissionRequest::new(label, scores),
    };

    let deps = WorkflowDeps {
        api: Arc::new(HttpAssessmentApi::new(
            config.api_url.clone(),
            config.api_token.clone(),
            config.request_timeout(),
        )?),
        ledger: Arc::new(HttpTokenLedger::new(
            config.ledger_url.clone(),
            config.api_token.clone(),
            config.ledger_timeout(),
        )?),
        push: Some(Arc::new(WsPushConnector::new(
            config.push_url.clone(),
            config.request_timeout(),
        ))),
    };

    let observer = Arc::new(TerminalObserver::start(&request.assessment_label));
    let workflow = Workflow::spawn(deps, config.workflow_config(), observer.clone());
    let record = drive(&workflow, request).await;
    observer.finish();
    workflow.shutdown().await;

    let record = record?;
    ui::print_audit(&record);
    if record.status != WorkflowState::Completed {
        bail!("assessment ended as {}", record.status);
    }
    Ok(())
}

/// Submits and waits for the terminal state; a failed submit still yields its audit record.
async fn drive(workflow: &Workflow, request: SubmissionRequest) -> Result<AuditRecord> {
    match workflow.submit(request).await {
        Ok(outcome) => info!(job_id = %outcome.job_id, deduplicated = outcome.deduplicated, "submitted"),
        Err(err) => info!(error = %err, "submission failed"),
    }
    let job = workflow.wait_terminal().await?;
    Ok(AuditRecord::from_job(&job))
}

async fn demo(config: &AssessflowConfig, balance: i64, fail: bool, cancel: bool) -> Result<()> {
    let ledger = Arc::new(InMemoryLedger::new(balance));
    let notifier = LocalNotifier::new(DEMO_TOKEN);
    let plan = SimPlan {
        outcome: if fail {
            SimOutcome::Fail("simulated analysis error".into())
        } else {
            SimOutcome::Complete
        },
        ..SimPlan::default()
    };
    let api = Arc::new(SimulatedAssessmentApi::new(plan).with_notifier(notifier.clone()));

    let mut settings = config.workflow_config();
    settings.monitor.auth_token = DEMO_TOKEN.to_string();

    let deps = WorkflowDeps {
        api,
        ledger: ledger.clone(),
        push: Some(Arc::new(notifier)),
    };
    let observer = Arc::new(TerminalObserver::start("demo"));
    let workflow = Workflow::spawn(deps, settings, observer.clone());

    let request = SubmissionRequest::new(
        "big-five",
        BTreeMap::from([
            ("openness".to_string(), 71.5),
            ("conscientiousness".to_string(), 64.0),
            ("extraversion".to_string(), 48.0),
            ("agreeableness".to_string(), 80.5),
            ("neuroticism".to_string(), 32.0),
        ]),
    );

    let record = if cancel {
        let _ = workflow.submit(request).await;
        workflow
            .wait_until(|job| job.status == WorkflowState::Processing || job.is_terminal())
            .await?;
        workflow.cancel().await?;
        AuditRecord::from_job(&workflow.wait_terminal().await?)
    } else {
        drive(&workflow, request).await?
    };
    observer.finish();
    workflow.shutdown().await;

    ui::print_audit(&record);
    println!("final balance: {} tokens", ledger.current_balance());
    Ok(())
}
