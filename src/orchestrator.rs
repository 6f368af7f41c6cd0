use anyhow::Context;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::anthropic::MessageSender;
use crate::company::{Company, CompanyResolver};
use crate::config::{DossierConfig, GateConfig, VerificationConfig};
use crate::error::user_message;
use crate::gate::{CallRequest, ResilienceState, ResilientCallGate};
use crate::micro_agents::{AgentContext, MicroAgentOrchestrator};
use crate::parser::{DraftParser, ParseError};
use crate::progress::{ProgressSender, ProgressUpdate};
use crate::report::{CompanyProfile, DraftReport, SENTINEL};
use crate::retrieval::{Retriever, build_context, persona_queries};
use crate::schema;
use crate::state_machine::{
    AuditRecord, FailureKind, Job, JobOutcome, State, StateMachine,
};
use crate::store::{JobStore, ReportStore};
use crate::verify::{VerificationLog, VerificationLoop};

/// Marker of the structured generation call's system prompt.
pub const GENERATION_ROLE: &str = "company research analyst";

/// Progress once the structured draft has parsed, before the micro-agents run.
const DRAFT_PROGRESS: u8 = 50;

/// What earlier phases of a run hand to later ones.
#[derive(Default)]
struct RunData {
    company: Option<Company>,
    sources: String,
    source_count: usize,
    draft: Option<DraftReport>,
    merge_lossless: bool,
    verification: Option<VerificationLog>,
}

fn system_failure(err: anyhow::Error) -> FailureKind {
    FailureKind::System(user_message(&err))
}

/// Drives jobs through INIT → RETRIEVE → GENERATE → VERIFY → PERSIST.
pub struct PipelineOrchestrator<S, C, RS, JS> {
    gate: ResilientCallGate<S>,
    resolver: C,
    reports: RS,
    jobs: JS,
    generation_attempts: u32,
    gate_config: GateConfig,
    verification: VerificationConfig,
}

impl<S, C, RS, JS> PipelineOrchestrator<S, C, RS, JS>
where
    S: MessageSender,
    C: CompanyResolver,
    RS: ReportStore,
    JS: JobStore,
{
    pub fn new(sender: S, resolver: C, reports: RS, jobs: JS, config: &DossierConfig) -> Self {
        Self {
            gate: ResilientCallGate::new(
                sender,
                config.gate.clone(),
                config.model.clone(),
                config.max_tokens,
            ),
            resolver,
            reports,
            jobs,
            generation_attempts: config.generation_attempts.max(1),
            gate_config: config.gate.clone(),
            verification: config.verification.clone(),
        }
    }

    pub fn gate(&self) -> &ResilientCallGate<S> {
        &self.gate
    }

    pub fn reports(&self) -> &RS {
        &self.reports
    }

    pub fn jobs(&self) -> &JS {
        &self.jobs
    }

    /// Runs `job` to a terminal status and returns its audit record.
    ///
    /// Phase failures never escape: they end the job as `Failed` or
    /// `Rejected`. The retriever is closed before returning in every case.
    pub async fn run<R: Retriever>(
        &self,
        job: &mut Job,
        mut retriever: R,
        progress: &ProgressSender,
    ) -> AuditRecord {
        StateMachine::start(job);
        self.publish(job, progress);
        info!(job_id = %job.id, company = %job.company, topic = %job.topic, "job started");

        let resilience = ResilienceState::new(&self.gate_config);
        let mut data = RunData::default();

        while job.state != State::End {
            let phase = job.state;
            let result = match phase {
                State::Init => self.init(job, &mut data),
                State::Retrieve => {
                    self.retrieve(job, &mut data, &retriever, progress).await
                }
                State::Generate => {
                    self.generate(job, &mut data, &resilience, progress).await
                }
                State::Verify => self.verify(&mut data, &resilience).await,
                State::Persist => self.persist(job, &mut data, &resilience),
                State::End => Ok(()),
            };

            let outcome = match result {
                Ok(()) => JobOutcome::Success,
                Err(kind) => {
                    warn!(job_id = %job.id, phase = %phase, reason = %kind, "phase failed");
                    JobOutcome::Failure(kind)
                }
            };
            let transition = StateMachine::next(job, outcome);
            debug!(job_id = %job.id, phase = %phase, ?transition, "phase finished");
            self.publish(job, progress);
        }

        if let Err(e) = retriever.close().await {
            warn!(job_id = %job.id, error = %e, "failed to close retriever");
        }

        let snapshot = resilience.snapshot();
        info!(
            job_id = %job.id,
            status = %job.status,
            total_calls = snapshot.total_calls,
            total_retries = snapshot.total_retries,
            mode = %snapshot.mode,
            verification_loops = data.verification.as_ref().map_or(0, |log| log.total_loops()),
            "job finished"
        );
        AuditRecord::from_job(job)
    }

    /// Saves the job and pushes its state to subscribers.
    fn publish(&self, job: &Job, progress: &ProgressSender) {
        if let Err(e) = self.jobs.save(job) {
            warn!(job_id = %job.id, error = %e, "failed to save job");
        }
        progress.send_replace(ProgressUpdate::from(job));
    }

    fn init(&self, job: &mut Job, data: &mut RunData) -> Result<(), FailureKind> {
        let company = self
            .resolver
            .resolve(&job.company)
            .context("company resolution failed")
            .map_err(system_failure)?;
        debug!(job_id = %job.id, slug = %company.slug, "company resolved");
        job.company = company.name.clone();
        data.company = Some(company);
        Ok(())
    }

    async fn retrieve<R: Retriever>(
        &self,
        job: &mut Job,
        data: &mut RunData,
        retriever: &R,
        progress: &ProgressSender,
    ) -> Result<(), FailureKind> {
        let company = data.company.as_ref().map_or(job.company.as_str(), |c| c.name.as_str());
        let queries = persona_queries(company, &job.topic);
        let total = queries.len();
        let start = State::Init.progress_on_exit();
        let span = State::Retrieve.progress_on_exit() - start;

        let mut seen_urls: Vec<String> = Vec::new();
        let mut results = Vec::new();
        for (idx, query) in queries.iter().enumerate() {
            match retriever.search(query, &seen_urls).await {
                Ok(found) if found.is_empty() => debug!(query = %query, "query returned nothing"),
                Ok(found) => {
                    for result in found {
                        if !seen_urls.contains(&result.url) {
                            seen_urls.push(result.url.clone());
                            results.push(result);
                        }
                    }
                }
                Err(e) => warn!(query = %query, error = %e, "search failed, skipping query"),
            }
            let done = idx + 1;
            let step = (usize::from(span) * done / total) as u8;
            job.set_progress(start + step, format!("Searched {done}/{total} queries"));
            self.publish(job, progress);
        }

        if results.is_empty() {
            warn!(job_id = %job.id, "no sources found");
        }
        info!(job_id = %job.id, sources = results.len(), "retrieval finished");
        data.source_count = results.len();
        data.sources = build_context(&results);
        Ok(())
    }

    async fn generate(
        &self,
        job: &mut Job,
        data: &mut RunData,
        resilience: &ResilienceState,
        progress: &ProgressSender,
    ) -> Result<(), FailureKind> {
        let company = data.company.as_ref().map_or(job.company.clone(), |c| c.name.clone());
        let system = generation_system(&company, &job.topic);
        let base = generation_prompt(&company, &job.topic, &data.sources);

        let mut last_error: Option<ParseError> = None;
        let mut profile = None;
        for attempt in 1..=self.generation_attempts {
            let user = match &last_error {
                Some(e) => {
                    info!(job_id = %job.id, attempt, error = %e, "retrying generation with correction");
                    DraftParser::build_retry_prompt(&base, e)
                }
                None => base.clone(),
            };
            let request = CallRequest::new(format!("generate:{attempt}"), system.clone(), user);

            let Some(text) = self.gate.submit(resilience, &request).await else {
                warn!(job_id = %job.id, attempt, "generation call returned nothing");
                continue;
            };
            match DraftParser::parse::<CompanyProfile>(&text) {
                Ok(parsed) => {
                    info!(job_id = %job.id, attempt, "draft accepted");
                    profile = Some(parsed);
                    break;
                }
                Err(e) => {
                    warn!(job_id = %job.id, attempt, error = %e, "draft rejected by parser");
                    last_error = Some(e);
                }
            }
        }

        let Some(profile) = profile else {
            // No attempt produced any text: the model was unreachable.
            return Err(match last_error {
                Some(e) => FailureKind::ContentQuality(format!(
                    "no valid draft after {} attempts: {e}",
                    self.generation_attempts
                )),
                None => FailureKind::System(format!(
                    "model unavailable for all {} generation attempts",
                    self.generation_attempts
                )),
            });
        };
        job.set_progress(DRAFT_PROGRESS, "Draft generated");
        self.publish(job, progress);

        let agents = MicroAgentOrchestrator::new(&self.gate);
        let output = agents
            .run(
                resilience,
                AgentContext {
                    company: &company,
                    topic: &job.topic,
                    sources: &data.sources,
                },
            )
            .await;
        data.merge_lossless = output.merge_report.is_lossless();
        data.draft = Some(DraftReport::assemble(profile, output.swot, output.interview_prep));
        Ok(())
    }

    async fn verify(
        &self,
        data: &mut RunData,
        resilience: &ResilienceState,
    ) -> Result<(), FailureKind> {
        let Some(draft) = data.draft.take() else {
            warn!("no draft to verify");
            return Ok(());
        };
        let verifier = VerificationLoop::new(&self.gate, &self.verification);
        let (draft, log) = verifier.run(resilience, draft, &data.sources).await;
        info!(
            total_loops = log.total_loops(),
            forced_delete = log.forced_delete,
            "verification complete"
        );
        data.draft = Some(draft);
        data.verification = Some(log);
        Ok(())
    }

    fn persist(
        &self,
        job: &mut Job,
        data: &mut RunData,
        resilience: &ResilienceState,
    ) -> Result<(), FailureKind> {
        let draft = data
            .draft
            .take()
            .ok_or_else(|| FailureKind::System("no draft to persist".to_string()))?;
        let content = serde_json::to_value(&draft)
            .context("failed to serialize report")
            .map_err(system_failure)?;
        let metadata = json!({
            "company": job.company,
            "slug": data.company.as_ref().map(|c| c.slug.clone()),
            "topic": job.topic,
            "source_count": data.source_count,
            "merge_lossless": data.merge_lossless,
            "verification": data.verification,
            "resilience": resilience.snapshot(),
        });
        let report_id = self
            .reports
            .create_report(&job.id, &content, &metadata)
            .context("failed to store report")
            .map_err(system_failure)?;
        job.report_id = Some(report_id);
        Ok(())
    }
}

fn generation_system(company: &str, topic: &str) -> String {
    format!(
        "You are a {GENERATION_ROLE}. Write the overview and culture sections of a report on \
         {company} for a candidate interested in {topic}. Use only facts stated in the sources. \
         Write \"{SENTINEL}\" for any field the sources do not support.\n\
         Respond with JSON only, matching this schema:\n{}",
        schema::schema_text::<CompanyProfile>()
    )
}

fn generation_prompt(company: &str, topic: &str, sources: &str) -> String {
    format!("Company: {company}\nFocus: {topic}\n\nSources:\n{sources}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::{Result, bail};

    use crate::company::NameResolver;
    use crate::micro_agents::{AGENT_ROLE, SYNTHESIS_ROLE};
    use crate::progress;
    use crate::retrieval::SearchResult;
    use crate::state_machine::JobStatus;
    use crate::testing::{Reply, ScriptedSender};
    use crate::verify::EVALUATOR_ROLE;

    const PROFILE: &str = r#"Here is the report:
```json
{
  "overview": {
    "summary": "Acme makes anvils for cartoon coyotes.",
    "business_model": "Direct sales of anvils",
    "products": ["Anvils"],
    "market_position": "Leading anvil supplier"
  },
  "culture": {
    "values": ["Persistence"],
    "work_style": "Fully remote teams",
    "employee_sentiment": "Employees describe it as demanding"
  }
}
```"#;

    #[derive(Default)]
    struct MemoryJobStore {
        saved: Mutex<Vec<Job>>,
    }

    impl MemoryJobStore {
        fn history(&self) -> Vec<Job> {
            self.saved.lock().unwrap().clone()
        }
    }

    impl JobStore for MemoryJobStore {
        fn save(&self, job: &Job) -> Result<()> {
            self.saved.lock().unwrap().push(job.clone());
            Ok(())
        }

        fn load(&self, id: &str) -> Result<Job> {
            match self.history().into_iter().rev().find(|j| j.id == id) {
                Some(job) => Ok(job),
                None => bail!("job {id} not found"),
            }
        }

        fn list(&self) -> Result<Vec<Job>> {
            Ok(self.history())
        }

        fn recover_interrupted(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct MemoryReportStore {
        reports: Mutex<Vec<(String, serde_json::Value, serde_json::Value)>>,
        fail: bool,
    }

    impl ReportStore for MemoryReportStore {
        fn create_report(
            &self,
            job_id: &str,
            content: &serde_json::Value,
            metadata: &serde_json::Value,
        ) -> Result<String> {
            if self.fail {
                bail!("disk full");
            }
            let mut reports = self.reports.lock().unwrap();
            reports.push((job_id.to_string(), content.clone(), metadata.clone()));
            Ok(format!("report-{}", reports.len()))
        }
    }

    struct StaticRetriever {
        results: Vec<SearchResult>,
        closed: Arc<AtomicBool>,
        failing: bool,
    }

    impl StaticRetriever {
        fn new(closed: Arc<AtomicBool>) -> Self {
            Self {
                results: vec![SearchResult {
                    url: "https://acme.test/about".into(),
                    title: "About Acme".into(),
                    snippets: vec!["Acme makes anvils for cartoon coyotes.".into()],
                    description: "Anvil maker".into(),
                }],
                closed,
                failing: false,
            }
        }
    }

    impl Retriever for StaticRetriever {
        async fn search(&self, _query: &str, exclude_urls: &[String]) -> Result<Vec<SearchResult>> {
            if self.failing {
                bail!("search backend unavailable");
            }
            Ok(self
                .results
                .iter()
                .filter(|r| !exclude_urls.contains(&r.url))
                .cloned()
                .collect())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> DossierConfig {
        let mut config = DossierConfig::default();
        config.gate.base_delay_ms = 1;
        config.gate.max_delay_ms = 2;
        config
    }

    fn sender(generation: impl IntoIterator<Item = Reply>) -> ScriptedSender {
        ScriptedSender::new()
            .route(GENERATION_ROLE, generation)
            .route(AGENT_ROLE, [Reply::text(r#"{"items": ["Grounded in the sources"]}"#)])
            .route(
                SYNTHESIS_ROLE,
                [Reply::text(
                    r#"{"strategic_summary": "A strong niche player.", "preparation_focus": "Know the anvil market."}"#,
                )],
            )
            .route(EVALUATOR_ROLE, [Reply::text(r#"{"findings": []}"#)])
    }

    type TestOrchestrator =
        PipelineOrchestrator<ScriptedSender, NameResolver, MemoryReportStore, MemoryJobStore>;

    fn orchestrator(sender: ScriptedSender, reports: MemoryReportStore) -> TestOrchestrator {
        PipelineOrchestrator::new(
            sender,
            NameResolver,
            reports,
            MemoryJobStore::default(),
            &config(),
        )
    }

    async fn run(orch: &TestOrchestrator, job: &mut Job) -> (AuditRecord, bool) {
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, _rx) = progress::channel(job);
        let record = orch
            .run(job, StaticRetriever::new(closed.clone()), &tx)
            .await;
        (record, closed.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn valid_first_attempt_completes_the_job() {
        let orch = orchestrator(sender([Reply::text(PROFILE)]), MemoryReportStore::default());
        let mut job = Job::new("Acme", "backend engineering");

        let (record, closed) = run(&orch, &mut job).await;

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.report_id.as_deref(), Some("report-1"));
        assert!(closed);
        assert_eq!(orch.gate().sender().prompts_matching(GENERATION_ROLE).len(), 1);
        assert_eq!(
            record.state_transitions,
            vec![
                State::Init,
                State::Retrieve,
                State::Generate,
                State::Verify,
                State::Persist,
                State::End
            ]
        );

        let reports = orch.reports().reports.lock().unwrap();
        let (job_id, content, metadata) = &reports[0];
        assert_eq!(job_id, &job.id);
        assert_eq!(content["overview"]["summary"], "Acme makes anvils for cartoon coyotes.");
        assert_eq!(content["swot"]["strengths"][0], "Grounded in the sources");
        assert_eq!(content["swot"]["strategic_summary"], "A strong niche player.");
        assert_eq!(metadata["slug"], "acme");
        assert_eq!(metadata["verification"]["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn progress_never_decreases_on_success() {
        let orch = orchestrator(sender([Reply::text(PROFILE)]), MemoryReportStore::default());
        let mut job = Job::new("Acme", "design");

        run(&orch, &mut job).await;

        let history = orch.jobs().history();
        assert!(history.len() >= 6);
        assert!(history.windows(2).all(|w| w[0].progress <= w[1].progress));
        assert_eq!(history.last().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn retries_embed_the_previous_parse_error() {
        let orch = orchestrator(
            sender([
                Reply::text("I could not find anything useful."),
                Reply::text(r#"{"overview": {"summary": 5}, "culture": {}}"#),
                Reply::text(PROFILE),
            ]),
            MemoryReportStore::default(),
        );
        let mut job = Job::new("Acme", "data");

        let (record, _) = run(&orch, &mut job).await;

        assert_eq!(record.status, JobStatus::Completed);
        let prompts = orch.gate().sender().prompts_matching(GENERATION_ROLE);
        assert_eq!(prompts.len(), 3);
        assert!(!prompts[0].contains("could not be used"));
        assert!(prompts[1].contains("no JSON object found in model output"));
        assert!(prompts[2].contains("expected string"));
        assert!(!prompts[2].contains("no JSON object found"));
    }

    #[tokio::test]
    async fn exhausted_generation_rejects_the_job() {
        let orch = orchestrator(
            sender([
                Reply::text("nope"),
                Reply::text("still nope"),
                Reply::text(r#"{"overview": "flat"}"#),
            ]),
            MemoryReportStore::default(),
        );
        let mut job = Job::new("Acme", "support");

        let (record, closed) = run(&orch, &mut job).await;

        assert_eq!(record.status, JobStatus::Rejected);
        assert_eq!(job.progress, 0);
        assert!(job.message.contains("expected object"), "{}", job.message);
        assert!(closed);
        assert!(orch.gate().sender().prompts_matching(AGENT_ROLE).is_empty());
        assert!(orch.reports().reports.lock().unwrap().is_empty());
        assert!(job.report_id.is_none());
    }

    #[tokio::test]
    async fn rejection_keeps_the_parse_error_when_the_last_call_fails() {
        let orch = orchestrator(
            sender([
                Reply::text("nope"),
                Reply::text(r#"{"overview": "flat"}"#),
                Reply::Status(401, "unauthorized".into()),
            ]),
            MemoryReportStore::default(),
        );
        let mut job = Job::new("Acme", "support");

        let (record, _) = run(&orch, &mut job).await;

        assert_eq!(record.status, JobStatus::Rejected);
        assert!(job.message.contains("expected object"), "{}", job.message);
        assert_eq!(orch.gate().sender().prompts_matching(GENERATION_ROLE).len(), 3);
    }

    #[tokio::test]
    async fn unreachable_model_fails_instead_of_rejecting() {
        let orch = orchestrator(
            sender([Reply::Status(401, "unauthorized".into())]),
            MemoryReportStore::default(),
        );
        let mut job = Job::new("Acme", "support");

        let (record, closed) = run(&orch, &mut job).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(job.progress, 0);
        assert!(job.message.contains("model unavailable"), "{}", job.message);
        assert!(closed);
        assert!(orch.reports().reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_company_fails_without_model_calls() {
        let orch = orchestrator(sender([Reply::text(PROFILE)]), MemoryReportStore::default());
        let mut job = Job::new("   ", "ops");

        let (record, closed) = run(&orch, &mut job).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.state_transitions, vec![State::Init, State::End]);
        assert!(job.message.contains("company name is empty"));
        assert!(orch.gate().sender().requests().is_empty());
        assert!(closed);
    }

    #[tokio::test]
    async fn storage_failure_fails_the_job() {
        let reports = MemoryReportStore {
            fail: true,
            ..MemoryReportStore::default()
        };
        let orch = orchestrator(sender([Reply::text(PROFILE)]), reports);
        let mut job = Job::new("Acme", "ops");

        let (record, closed) = run(&orch, &mut job).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(job.progress, 0);
        assert!(job.message.contains("disk full"));
        assert!(closed);
    }

    #[tokio::test]
    async fn failing_searches_are_skipped() {
        let orch = orchestrator(sender([Reply::text(PROFILE)]), MemoryReportStore::default());
        let mut job = Job::new("Acme", "ops");
        let closed = Arc::new(AtomicBool::new(false));
        let retriever = StaticRetriever {
            failing: true,
            ..StaticRetriever::new(closed.clone())
        };
        let (tx, rx) = progress::channel(&job);

        let record = orch.run(&mut job, retriever, &tx).await;

        assert_eq!(record.status, JobStatus::Completed);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(rx.borrow().progress, 100);
        assert_eq!(rx.borrow().report_id.as_deref(), Some("report-1"));
    }
}
