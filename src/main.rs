mod cli;
mod ui;

use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cli::{Cli, Command};
use dossier::anthropic::AnthropicClient;
use dossier::company::NameResolver;
use dossier::config::DossierConfig;
use dossier::error::{DossierError, user_message};
use dossier::orchestrator::PipelineOrchestrator;
use dossier::progress;
use dossier::retrieval::LocalCorpus;
use dossier::state_machine::{AuditRecord, Job, JobStatus};
use dossier::store::{FileJobStore, FileReportStore, JobStore};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", user_message(&e));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "dossier=debug" } else { "dossier=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config = DossierConfig::load()?;
    cli.apply_overrides(&mut config);
    let jobs = FileJobStore::new(&config.data_dir);

    match cli.command {
        Command::Generate {
            company,
            topic,
            sources,
        } => generate(&config, jobs, company, topic, &sources).await,
        Command::Status { job_id: Some(id) } => {
            ui::print_audit(&AuditRecord::from_job(&jobs.load(&id)?));
            Ok(true)
        }
        Command::Status { job_id: None } => {
            ui::print_jobs(&jobs.list()?);
            Ok(true)
        }
        Command::Recover => {
            ui::print_recovered(&jobs.recover_interrupted()?);
            Ok(true)
        }
    }
}

async fn generate(
    config: &DossierConfig,
    jobs: FileJobStore,
    company: String,
    topic: String,
    sources: &Path,
) -> Result<bool> {
    let recovered = jobs.recover_interrupted()?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "marked interrupted jobs as failed");
    }
    if config.api_key.is_empty() {
        return Err(DossierError::Config(
            "no API key: set ANTHROPIC_API_KEY or api_key in dossier.toml".into(),
        )
        .into());
    }

    let corpus = LocalCorpus::load(sources)?;
    let client = AnthropicClient::new(config.api_key.clone())?;
    let orchestrator = PipelineOrchestrator::new(
        client,
        NameResolver,
        FileReportStore::new(&config.data_dir),
        jobs,
        config,
    );

    let mut job = Job::new(company, topic);
    let (tx, rx) = progress::channel(&job);
    let bar = ui::JobProgress::start(&job.company);
    let (record, ()) = tokio::join!(orchestrator.run(&mut job, corpus, &tx), bar.follow(rx));

    bar.complete(&record);
    ui::print_audit(&record);
    Ok(record.status == JobStatus::Completed)
}
