//! Generation Coordinator: owns every session's state machine.
//!
//! Each session runs as one spawned task that plans, drafts sections
//! strictly in outline order, refreshes the global summary after each, and
//! finally checks coherence. Sessions share nothing mutable; the budget
//! guard, planner and checker are stateless and shared.
//!
//! ```text
//! start() --> planning --> drafting --> revising --> completed
//!                 |            |  ^       ^  |
//!                 |            v  |       |  |
//!                 |           paused -----+<-+
//!                 `-----------+----+-------> failed
//! ```
//!
//! Abort cancels the in-flight call, requeues the section being drafted
//! and holds the session in `paused` until it is resumed or released.

pub mod control;
pub mod events;
mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

use scribe_store::Store;
use scribe_store::models::{
    CoherenceReport, DraftMode, FailureInfo, GenerationSession, GlobalSummary, Section,
    SessionPhase, render_document,
};
use scribe_store::queries::{reports as report_db, sections as section_db, sessions as session_db};

use crate::budget::BudgetGuard;
use crate::capability::{Generator, Retriever};
use crate::coherence::{CheckedSection, CoherenceChecker, CoherenceError};
use crate::config::{ConfigError, PipelineConfig};
use crate::outline::{OutlinePlanner, PlanOutcome};
use crate::section::{DraftEvent, DraftStream, SectionError, SectionGenerator, SectionRequest};
use crate::summary::{ExtractiveRefresher, GenerativeRefresher, SummaryRefresher, SummaryStrategy};

use control::SessionControl;
pub use control::RunState;
pub use events::SessionEvent;
use session::SessionRun;

/// A request to generate one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRequest {
    pub document_id: Uuid,
    pub prompt: String,
    pub template_id: Option<String>,
}

impl DocumentRequest {
    /// A request for a new document.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            document_id: Uuid::new_v4(),
            prompt: prompt.into(),
            template_id: None,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }
}

/// Final state of a session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub phase: SessionPhase,
    pub mode: Option<DraftMode>,
    /// Every section with its state; completed ones carry their text.
    pub sections: Vec<Section>,
    /// The summary in force when the session stopped.
    pub summary: GlobalSummary,
    pub report: Option<CoherenceReport>,
    pub failure: Option<FailureInfo>,
}

impl SessionOutcome {
    /// Completed sections rendered as Markdown. Partial output of failed
    /// or released sessions is included.
    pub fn document_text(&self) -> String {
        render_document(&self.sections)
    }
}

/// A running session: its events and its eventual outcome.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub events: mpsc::Receiver<SessionEvent>,
    pub join: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Next event, or `None` once the session has finished.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Stop listening to events and wait for the outcome. A paused
    /// session only finishes once resumed or released.
    pub async fn wait(self) -> Result<SessionOutcome, JoinError> {
        drop(self.events);
        self.join.await
    }

    /// Collect every event, then the outcome.
    pub async fn collect(mut self) -> Result<(Vec<SessionEvent>, SessionOutcome), JoinError> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self.join.await?;
        Ok((events, outcome))
    }
}

/// Why a control or revise call was refused.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("session {0} not found")]
    UnknownSession(Uuid),

    #[error("no session found for document {0}")]
    UnknownDocument(Uuid),

    #[error("session {session_id} already finished ({phase})")]
    AlreadyFinished {
        session_id: Uuid,
        phase: SessionPhase,
    },

    #[error("session {0} was released and can no longer be controlled")]
    Released(Uuid),

    #[error("no coherence report available: {0}")]
    ReportUnavailable(#[from] CoherenceError),
}

/// Shared, immutable pipeline parts.
#[derive(Clone)]
pub(crate) struct Components {
    pub(crate) config: PipelineConfig,
    pub(crate) guard: BudgetGuard,
    pub(crate) planner: OutlinePlanner,
    pub(crate) sections: SectionGenerator,
    pub(crate) refresher: Arc<dyn SummaryRefresher>,
    pub(crate) retriever: Arc<dyn Retriever>,
    pub(crate) checker: CoherenceChecker,
}

/// Entry point for planning, drafting and controlling sessions.
///
/// Cheap to clone; clones share sessions and the store.
#[derive(Clone)]
pub struct Coordinator {
    components: Arc<Components>,
    store: Store,
    sessions: Arc<Mutex<HashMap<Uuid, SessionControl>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.components.config)
            .field("refresher", &self.components.refresher.name())
            .finish()
    }
}

impl Coordinator {
    /// Validate `config` and assemble the pipeline.
    pub fn new(
        config: PipelineConfig,
        generator: Arc<dyn Generator>,
        retriever: Arc<dyn Retriever>,
        store: Store,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let guard = config.guard()?;

        let refresher: Arc<dyn SummaryRefresher> = match config.summary.strategy {
            SummaryStrategy::Extractive => Arc::new(ExtractiveRefresher),
            SummaryStrategy::Generative => Arc::new(GenerativeRefresher::new(
                Arc::clone(&generator),
                guard,
                Duration::from_secs(config.summary.timeout_secs),
            )),
        };
        debug!(refresher = refresher.name(), ceiling = guard.ceiling(), "coordinator configured");

        let components = Components {
            guard,
            planner: OutlinePlanner::new(Arc::clone(&generator), guard, config.planner),
            sections: SectionGenerator::new(generator, guard, config.section),
            refresher,
            retriever,
            checker: CoherenceChecker::new(config.coherence),
            config,
        };
        Ok(Self {
            components: Arc::new(components),
            store,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Replace the summary refresher chosen by the configured strategy.
    pub fn with_refresher(mut self, refresher: Arc<dyn SummaryRefresher>) -> Self {
        Arc::make_mut(&mut self.components).refresher = refresher;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.components.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Plan a document without starting a session.
    pub async fn plan(&self, prompt: &str, template_id: Option<&str>) -> PlanOutcome {
        self.components.planner.plan(prompt, template_id).await
    }

    /// Draft a single section outside any session.
    ///
    /// A request that does not fit even after trimming yields one
    /// `Failed(BudgetExceeded)` event.
    pub fn draft_section(&self, request: SectionRequest) -> DraftStream {
        match self.components.sections.prepare(request) {
            Ok(prepared) => self.components.sections.draft(prepared),
            Err(rejection) => Box::pin(futures::stream::once(async move {
                DraftEvent::Failed(SectionError::BudgetExceeded(rejection))
            })),
        }
    }

    /// Check the completed sections of the document's latest session and
    /// append the report to the document's history.
    pub async fn revise_global(&self, document_id: Uuid) -> Result<CoherenceReport, ControlError> {
        let session = session_db::latest_session_for_document(&self.store, document_id)
            .await
            .ok_or(ControlError::UnknownDocument(document_id))?;
        let sections = section_db::list_sections(&self.store, session.id).await;
        let report = self
            .components
            .checker
            .check(document_id, &CheckedSection::from_sections(&sections))?;
        report_db::insert_report(&self.store, report.clone()).await;
        info!(document_id = %document_id, score = report.score, flags = report.flags.len(), "document revised");
        Ok(report)
    }

    /// Start generating a document in the background.
    ///
    /// Events are delivered through a bounded queue. Drain
    /// [`SessionHandle::events`] or call [`SessionHandle::wait`]; a handle
    /// that keeps the receiver without reading it eventually stalls the
    /// session.
    pub async fn start(&self, request: DocumentRequest) -> SessionHandle {
        let session = session_db::insert_session(
            &self.store,
            GenerationSession::new(request.document_id, request.prompt, request.template_id),
        )
        .await;
        let session_id = session.id;
        let document_id = session.document_id;

        let (tx, rx) = mpsc::channel(self.components.config.events.buffer);
        let (control, signal) = SessionControl::new();
        self.sessions.lock().await.insert(session_id, control);

        let run = SessionRun::new(
            Arc::clone(&self.components),
            self.store.clone(),
            session,
            signal,
            tx,
        );
        let sessions = Arc::clone(&self.sessions);
        let store = self.store.clone();
        let join = tokio::spawn(async move {
            let outcome = run.run().await;
            sessions.lock().await.remove(&outcome.session_id);
            let pruned = store.prune_finished().await;
            if pruned > 0 {
                debug!(pruned, "finished sessions evicted from the store");
            }
            outcome
        });

        SessionHandle {
            session_id,
            document_id,
            events: rx,
            join,
        }
    }

    /// Stop issuing generation calls at the next checkpoint.
    pub async fn pause(&self, session_id: Uuid) -> Result<(), ControlError> {
        self.with_control(session_id, |c| c.pause()).await?;
        info!(session_id = %session_id, "pause requested");
        Ok(())
    }

    pub async fn resume(&self, session_id: Uuid) -> Result<(), ControlError> {
        self.with_control(session_id, |c| c.resume()).await?;
        info!(session_id = %session_id, "resume requested");
        Ok(())
    }

    /// Cancel the in-flight call and discard the partial section. The
    /// session holds in `paused` until [`Self::resume`], which redrafts
    /// that section from scratch.
    pub async fn abort(&self, session_id: Uuid) -> Result<(), ControlError> {
        self.with_control(session_id, |c| c.abort()).await?;
        info!(session_id = %session_id, "abort requested");
        Ok(())
    }

    /// End a session's task without finishing it. Any in-flight call is
    /// cancelled; completed sections and the summary stay in the store and
    /// the session is left `paused`.
    pub async fn release(&self, session_id: Uuid) -> Result<(), ControlError> {
        self.with_control(session_id, |c| c.release()).await?;
        self.sessions.lock().await.remove(&session_id);
        info!(session_id = %session_id, "session released");
        Ok(())
    }

    /// Ids of sessions whose task is still running.
    pub async fn live_sessions(&self) -> Vec<Uuid> {
        self.sessions.lock().await.keys().copied().collect()
    }

    /// Requested run state of a live session.
    pub async fn run_state(&self, session_id: Uuid) -> Option<RunState> {
        self.sessions.lock().await.get(&session_id).map(|c| c.state())
    }

    async fn with_control<F>(&self, session_id: Uuid, f: F) -> Result<(), ControlError>
    where
        F: FnOnce(&SessionControl),
    {
        match session_db::get_session(&self.store, session_id).await {
            None => return Err(ControlError::UnknownSession(session_id)),
            Some(s) if s.phase.is_terminal() => {
                return Err(ControlError::AlreadyFinished {
                    session_id,
                    phase: s.phase,
                });
            }
            Some(_) => {}
        }
        let sessions = self.sessions.lock().await;
        let control = sessions
            .get(&session_id)
            .ok_or(ControlError::Released(session_id))?;
        f(control);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ChunkStream, GenerationRequest, NoRetrieval};
    use async_trait::async_trait;

    /// Replies with a fixed outline to planning prompts and fixed text
    /// otherwise.
    struct Canned;

    const OUTLINE: &str = "## Alpha\n- first point\n## Beta\n- second point\n## Gamma\n- third point\n";

    #[async_trait]
    impl Generator for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
            if request.prompt.contains("Produce an outline") {
                Ok(OUTLINE.to_string())
            } else {
                Ok("The engine computes tables of numbers.".to_string())
            }
        }

        fn stream(&self, request: &GenerationRequest) -> ChunkStream {
            let reply = if request.prompt.contains("Produce an outline") {
                OUTLINE.to_string()
            } else {
                "The engine computes tables of numbers.".to_string()
            };
            Box::pin(futures::stream::iter(vec![Ok(reply)]))
        }
    }

    fn coordinator(config: PipelineConfig) -> Coordinator {
        Coordinator::new(config, Arc::new(Canned), Arc::new(NoRetrieval), Store::in_memory()).unwrap()
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let mut config = PipelineConfig::default();
        config.events.buffer = 0;
        let err = Coordinator::new(config, Arc::new(Canned), Arc::new(NoRetrieval), Store::in_memory())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero(_)));
    }

    #[tokio::test]
    async fn plan_returns_outline() {
        let c = coordinator(PipelineConfig::default());
        let PlanOutcome::Accepted(outline) = c.plan("write about engines", None).await else {
            panic!("expected accepted outline");
        };
        assert_eq!(outline.section_count(), 3);
    }

    #[tokio::test]
    async fn session_runs_to_completion() {
        let c = coordinator(PipelineConfig::default());
        let handle = c.start(DocumentRequest::new("write about engines")).await;
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.phase, SessionPhase::Completed);
        assert_eq!(outcome.mode, Some(DraftMode::Sectioned));
        assert_eq!(outcome.sections.len(), 3);
        assert_eq!(outcome.summary.version, 3);
        assert!(outcome.report.is_some());
        assert!(outcome.document_text().starts_with("## Alpha"));
    }

    #[tokio::test]
    async fn control_of_unknown_or_finished_session_is_refused() {
        let c = coordinator(PipelineConfig::default());
        assert!(matches!(
            c.pause(Uuid::new_v4()).await,
            Err(ControlError::UnknownSession(_))
        ));

        let handle = c.start(DocumentRequest::new("write about engines")).await;
        let id = handle.session_id;
        handle.wait().await.unwrap();
        assert!(matches!(
            c.abort(id).await,
            Err(ControlError::AlreadyFinished {
                phase: SessionPhase::Completed,
                ..
            })
        ));
        assert!(c.run_state(id).await.is_none());
    }

    #[tokio::test]
    async fn revise_global_appends_reports() {
        let c = coordinator(PipelineConfig::default());
        let request = DocumentRequest::new("write about engines");
        let document_id = request.document_id;
        c.start(request).await.wait().await.unwrap();

        let report = c.revise_global(document_id).await.unwrap();
        assert_eq!(report.document_id, document_id);
        assert_eq!(report.sections_checked, 3);
        assert_eq!(report_db::list_reports(c.store(), document_id).await.len(), 2);

        assert!(matches!(
            c.revise_global(Uuid::new_v4()).await,
            Err(ControlError::UnknownDocument(_))
        ));
    }

    #[tokio::test]
    async fn draft_section_over_budget_fails_once() {
        use futures::StreamExt;
        use crate::section::SectionBrief;

        let mut config = PipelineConfig::default();
        config.budget.ceiling = 1100;
        config.summary.cap_tokens = 100;
        config.planner.max_output_tokens = 100;
        config.section.max_output_tokens = 1000;
        let c = coordinator(config);

        let request = SectionRequest {
            section_id: Uuid::new_v4(),
            brief: SectionBrief {
                document_title: "Engines".to_string(),
                document_prompt: "word ".repeat(2000),
                outline_markdown: String::new(),
                title: "Alpha".to_string(),
                bullets: vec![],
                ordinal: 0,
                total_sections: 1,
                template_id: None,
            },
            mode: DraftMode::Sectioned,
            summary: String::new(),
            passages: vec![],
        };
        let events: Vec<DraftEvent> = c.draft_section(request).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DraftEvent::Failed(SectionError::BudgetExceeded(_))
        ));
    }
}
