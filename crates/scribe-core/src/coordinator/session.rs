//! The task that drives one session from planning to a terminal phase.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scribe_store::Store;
use scribe_store::models::{
    CoherenceReport, DraftMode, FailureInfo, GenerationSession, GlobalSummary, Outline, Section,
    SectionState, SessionPhase,
};
use scribe_store::queries::{
    reports as report_db, sections as section_db, sessions as session_db,
    summaries as summary_db,
};

use crate::capability::Passage;
use crate::coherence::CheckedSection;
use crate::error::PipelineError;
use crate::outline::PlanOutcome;
use crate::outline::planner::title_from_prompt;
use crate::section::{DraftEvent, PreparedSection, SectionBrief, SectionDraft, SectionError, SectionRequest};
use crate::state::{SectionStateMachine, SessionStateMachine};
use crate::summary::refresh_bounded;
use crate::tokens::{estimate_tokens, truncate_to_tokens};

use super::control::RunSignal;
use super::events::SessionEvent;
use super::{Components, SessionOutcome};

/// Attempts per section: the first call plus one retry.
const MAX_SECTION_ATTEMPTS: u32 = 2;

/// How one streaming attempt ended.
enum Streamed {
    Completed(SectionDraft),
    Failed(SectionError),
    /// Pause observed at an increment boundary, or an abort.
    Interrupted,
}

pub(crate) struct SessionRun {
    components: Arc<Components>,
    store: Store,
    session: GenerationSession,
    signal: RunSignal,
    events: mpsc::Sender<SessionEvent>,
    phase: SessionPhase,
    report: Option<CoherenceReport>,
}

impl SessionRun {
    pub(crate) fn new(
        components: Arc<Components>,
        store: Store,
        session: GenerationSession,
        signal: RunSignal,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            components,
            store,
            phase: session.phase,
            session,
            signal,
            events,
            report: None,
        }
    }

    fn id(&self) -> Uuid {
        self.session.id
    }

    /// Run until `completed` or `failed`, or until released while held.
    /// Never fails: errors end the session in `failed` with everything
    /// completed so far retained.
    pub(crate) async fn run(mut self) -> SessionOutcome {
        info!(session_id = %self.id(), document_id = %self.session.document_id, "session started");

        let phase = match self.drive().await {
            Ok(()) => self.phase,
            Err(e) => self.finish_with(e).await,
        };

        self.flush().await;
        info!(session_id = %self.id(), phase = %phase, "session finished");
        let outcome = self.outcome(phase).await;
        self.announce_finished(phase);
        outcome
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        let (outline, mode) = self.plan().await?;

        let sections: Vec<Section> = outline
            .sections()
            .into_iter()
            .enumerate()
            .map(|(ordinal, node)| Section::queued(node, ordinal))
            .collect();
        session_db::set_outline(&self.store, self.id(), outline.clone(), mode)
            .await
            .map_err(|e| PipelineError::irrecoverable(self.phase, e))?;
        section_db::insert_sections(&self.store, self.id(), sections.clone())
            .await
            .map_err(|e| PipelineError::irrecoverable(self.phase, e))?;
        self.transition(SessionPhase::Drafting).await?;

        for section in &sections {
            self.draft(&outline, mode, section).await?;
        }

        self.checkpoint().await?;
        self.transition(SessionPhase::Revising).await?;
        self.revise().await?;
        self.checkpoint().await?;
        self.transition(SessionPhase::Completed).await
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    async fn plan(&mut self) -> Result<(Outline, DraftMode), PipelineError> {
        let prompt = self.session.prompt.clone();
        let template_id = self.session.template_id.clone();

        // An abort cancels the planning call; planning restarts on resume.
        let outcome = loop {
            let planned = tokio::select! {
                _ = self.signal.interrupted() => None,
                outcome = self.components.planner.plan(&prompt, template_id.as_deref()) => Some(outcome),
            };
            match planned {
                Some(outcome) => break outcome,
                None => {
                    debug!(session_id = %self.id(), "planning call cancelled");
                    self.park().await?;
                }
            }
        };

        match outcome {
            PlanOutcome::Accepted(outline) => {
                self.emit(SessionEvent::OutlineReady {
                    outline: outline.clone(),
                })
                .await;
                Ok((outline, DraftMode::Sectioned))
            }
            PlanOutcome::Fallback { reason, attempts } => {
                warn!(session_id = %self.id(), attempts, reason = %reason, "planning fell back to single-shot draft");
                self.emit(SessionEvent::Fallback { reason }).await;
                Ok((
                    Outline::single(title_from_prompt(&prompt), template_id),
                    DraftMode::Fallback,
                ))
            }
        }
    }

    // ------------------------------------------------------------------
    // Drafting
    // ------------------------------------------------------------------

    /// Draft one section, retrying once, then fold it into the summary.
    async fn draft(
        &mut self,
        outline: &Outline,
        mode: DraftMode,
        section: &Section,
    ) -> Result<(), PipelineError> {
        let ordinal = section.ordinal;
        let mut state = SectionState::Queued;
        let mut failures: u32 = 0;

        loop {
            // Pause and abort take effect before the next admission.
            self.checkpoint().await?;

            let Some(request) = self
                .section_request(outline, mode, section, failures > 0)
                .await?
            else {
                continue;
            };
            let prepared = self
                .components
                .sections
                .prepare(request)
                .map_err(|rejection| PipelineError::BudgetExceeded { ordinal, rejection })?;
            self.report_budget(&prepared).await;

            SectionStateMachine::transition(
                &self.store,
                self.id(),
                section.id,
                state,
                SectionState::Streaming,
            )
            .await
            .map_err(|e| PipelineError::irrecoverable(self.phase, format!("{e:#}")))?;
            self.flush().await;
            self.emit(SessionEvent::SectionStarted {
                ordinal,
                attempt: failures + 1,
            })
            .await;
            debug!(session_id = %self.id(), ordinal, attempt = failures + 1, "section streaming");

            match self.stream(prepared).await {
                Streamed::Completed(draft) => {
                    return self.complete(section, draft).await;
                }
                Streamed::Interrupted => {
                    self.requeue(section).await?;
                    state = SectionState::Queued;
                }
                Streamed::Failed(err) => {
                    failures += 1;
                    let will_retry = failures < MAX_SECTION_ATTEMPTS;
                    warn!(session_id = %self.id(), ordinal, attempt = failures, error = %err, will_retry, "section failed");
                    SectionStateMachine::transition(
                        &self.store,
                        self.id(),
                        section.id,
                        SectionState::Streaming,
                        SectionState::Failed,
                    )
                    .await
                    .map_err(|e| PipelineError::irrecoverable(self.phase, format!("{e:#}")))?;
                    self.flush().await;
                    self.emit(SessionEvent::SectionFailed {
                        ordinal,
                        error: err.to_string(),
                        will_retry,
                    })
                    .await;

                    if !will_retry {
                        return Err(match mode {
                            DraftMode::Fallback => {
                                PipelineError::PlanningFailure(format!("fallback draft failed: {err}"))
                            }
                            DraftMode::Sectioned => PipelineError::GenerationFailure {
                                ordinal,
                                attempts: failures,
                                source: err,
                            },
                        });
                    }
                    state = SectionState::Failed;

                    // An abort during the backoff holds at the next checkpoint.
                    let delay = self.components.config.retry.delay();
                    tokio::select! {
                        _ = self.signal.interrupted() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Build the request for one attempt. A retry drops retrieval context,
    /// or halves the summary when there was none. `None` when an abort
    /// cancelled retrieval.
    async fn section_request(
        &self,
        outline: &Outline,
        mode: DraftMode,
        section: &Section,
        retry: bool,
    ) -> Result<Option<SectionRequest>, PipelineError> {
        let summary = summary_db::current_summary(&self.store, self.id())
            .await
            .ok_or_else(|| PipelineError::irrecoverable(self.phase, "session has no summary"))?;
        let bullets = outline
            .node(section.node_id)
            .map(|n| n.bullets.clone())
            .unwrap_or_default();

        let Some(passages) = self.retrieve(&section.title, &bullets).await else {
            return Ok(None);
        };
        let (summary_text, passages) = if !retry {
            (summary.text, passages)
        } else if passages.is_empty() {
            let halved = truncate_to_tokens(&summary.text, estimate_tokens(&summary.text) / 2);
            (halved, Vec::new())
        } else {
            (summary.text, Vec::new())
        };

        let (outline_markdown, total_sections) = match mode {
            DraftMode::Sectioned => (outline.to_markdown(), outline.section_count()),
            DraftMode::Fallback => (String::new(), 1),
        };
        Ok(Some(SectionRequest {
            section_id: section.id,
            brief: SectionBrief {
                document_title: outline.title.clone(),
                document_prompt: self.session.prompt.clone(),
                outline_markdown,
                title: section.title.clone(),
                bullets,
                ordinal: section.ordinal,
                total_sections,
                template_id: outline.template_id.clone(),
            },
            mode,
            summary: summary_text,
            passages,
        }))
    }

    /// Retrieval errors degrade to an empty context. `None` when
    /// interrupted.
    async fn retrieve(&self, title: &str, bullets: &[String]) -> Option<Vec<Passage>> {
        let limit = self.components.config.retrieval.limit;
        if limit == 0 {
            return Some(Vec::new());
        }
        let mut query = title.to_string();
        for bullet in bullets {
            query.push(' ');
            query.push_str(bullet);
        }

        let result = tokio::select! {
            _ = self.signal.interrupted() => return None,
            result = self.components.retriever.retrieve(&query, limit) => result,
        };
        match result {
            Ok(passages) => Some(passages),
            Err(e) => {
                warn!(session_id = %self.id(), error = %e, "retrieval failed, drafting without reference material");
                Some(Vec::new())
            }
        }
    }

    async fn report_budget(&self, prepared: &PreparedSection) {
        let fitted = &prepared.fitted;
        if !fitted.steps.is_empty() {
            info!(session_id = %self.id(), ordinal = prepared.ordinal, steps = fitted.steps.len(), "context trimmed to fit budget");
            self.emit(SessionEvent::ContextTrimmed {
                ordinal: prepared.ordinal,
                steps: fitted.steps.clone(),
            })
            .await;
        }
        if fitted.near_limit {
            self.emit(SessionEvent::BudgetWarning {
                ordinal: prepared.ordinal,
                total: fitted.total,
                ceiling: self.components.guard.ceiling(),
            })
            .await;
        }
    }

    /// Forward increments until a terminal event, a pause or an abort.
    ///
    /// Returning drops the draft stream, which cancels the external call.
    async fn stream(&self, prepared: PreparedSection) -> Streamed {
        let mut draft = self.components.sections.draft(prepared);
        loop {
            let event = tokio::select! {
                biased;
                _ = self.signal.interrupted() => return Streamed::Interrupted,
                event = draft.next() => event,
            };
            match event {
                Some(DraftEvent::Increment(increment)) => {
                    // Waits while the queue is full, which stops pulling
                    // from the generation stream.
                    tokio::select! {
                        biased;
                        _ = self.signal.interrupted() => return Streamed::Interrupted,
                        _ = self.events.send(SessionEvent::Increment(increment)) => {}
                    }
                    if self.signal.is_paused() {
                        return Streamed::Interrupted;
                    }
                }
                Some(DraftEvent::Completed(done)) => return Streamed::Completed(done),
                Some(DraftEvent::Failed(err)) => return Streamed::Failed(err),
                None => {
                    return Streamed::Failed(SectionError::Generation(
                        "draft stream ended without a result".to_string(),
                    ));
                }
            }
        }
    }

    /// `streaming -> queued`, discarding partial text.
    async fn requeue(&self, section: &Section) -> Result<(), PipelineError> {
        SectionStateMachine::transition(
            &self.store,
            self.id(),
            section.id,
            SectionState::Streaming,
            SectionState::Queued,
        )
        .await
        .map_err(|e| PipelineError::irrecoverable(self.phase, format!("{e:#}")))?;
        debug!(session_id = %self.id(), ordinal = section.ordinal, "partial section discarded");
        self.flush().await;
        Ok(())
    }

    /// Store the section, then supersede the summary with one that
    /// reflects it. Both happen before the next section may start. An
    /// abort cancels the refresh, which runs again on resume; the section
    /// itself is not redrafted.
    async fn complete(&mut self, section: &Section, draft: SectionDraft) -> Result<(), PipelineError> {
        let ordinal = section.ordinal;
        SectionStateMachine::complete(
            &self.store,
            self.id(),
            section.id,
            draft.text.clone(),
            draft.tokens,
        )
        .await
        .map_err(|e| PipelineError::irrecoverable(self.phase, format!("{e:#}")))?;
        self.flush().await;
        self.emit(SessionEvent::SectionCompleted {
            ordinal,
            tokens: draft.tokens,
        })
        .await;

        let prior = summary_db::current_summary(&self.store, self.id())
            .await
            .ok_or_else(|| PipelineError::irrecoverable(self.phase, "session has no summary"))?;
        let next = loop {
            let refreshed = tokio::select! {
                _ = self.signal.interrupted() => None,
                next = refresh_bounded(
                    self.components.refresher.as_ref(),
                    &prior,
                    &section.title,
                    &draft.text,
                    ordinal,
                    self.components.config.summary.cap_tokens,
                ) => Some(next),
            };
            match refreshed {
                Some(next) => break next,
                None => {
                    debug!(session_id = %self.id(), ordinal, "summary refresh cancelled");
                    self.park().await?;
                }
            }
        };
        let (version, tokens) = (next.version, next.token_count);

        let superseded = summary_db::supersede_summary(&self.store, self.id(), next)
            .await
            .map_err(|e| PipelineError::irrecoverable(self.phase, e))?;
        if !superseded {
            return Err(PipelineError::irrecoverable(
                self.phase,
                format!("summary version {version} was superseded concurrently"),
            ));
        }
        info!(session_id = %self.id(), ordinal, tokens = draft.tokens, summary_version = version, "section completed");
        self.flush().await;
        self.emit(SessionEvent::SummaryRefreshed {
            version,
            tokens,
            through_ordinal: ordinal,
        })
        .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Revising
    // ------------------------------------------------------------------

    /// Run the coherence checker. Analysis failures degrade to "no report";
    /// flags only fail the session when the hard gate is enabled.
    async fn revise(&mut self) -> Result<(), PipelineError> {
        let sections = section_db::list_sections(&self.store, self.id()).await;
        let checked = CheckedSection::from_sections(&sections);

        let report = match self
            .components
            .checker
            .check(self.session.document_id, &checked)
        {
            Ok(report) => report,
            Err(e) => {
                warn!(session_id = %self.id(), error = %e, "coherence report unavailable");
                self.emit(SessionEvent::ReportUnavailable {
                    reason: e.to_string(),
                })
                .await;
                return Ok(());
            }
        };

        info!(session_id = %self.id(), score = report.score, flags = report.flags.len(), "coherence report produced");
        report_db::insert_report(&self.store, report.clone()).await;
        self.flush().await;
        self.emit(SessionEvent::Report(report.clone())).await;
        let flagged = report.flags.len();
        self.report = Some(report);

        if self.components.config.coherence.block_on_flags && flagged > 0 {
            return Err(PipelineError::IrrecoverableFailure {
                phase: self.phase,
                reason: format!("coherence gate: {flagged} flagged section pair(s)"),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    /// Store the phase and its snapshot, then announce it.
    async fn transition(&mut self, to: SessionPhase) -> Result<(), PipelineError> {
        let from = self.phase;
        SessionStateMachine::transition(&self.store, self.id(), from, to)
            .await
            .map_err(|e| PipelineError::irrecoverable(from, format!("{e:#}")))?;
        self.phase = to;
        self.flush().await;
        self.emit(SessionEvent::PhaseChanged { from, to }).await;
        Ok(())
    }

    /// Honour pause and abort requests between steps.
    async fn checkpoint(&mut self) -> Result<(), PipelineError> {
        if self.signal.is_released() {
            return Err(PipelineError::SessionAborted);
        }
        if self.signal.is_paused() {
            self.park().await?;
        }
        Ok(())
    }

    /// Hold until resumed. Drafting and revising show as `paused`;
    /// planning has no paused phase and stays `planning` while held.
    async fn park(&mut self) -> Result<(), PipelineError> {
        let resume_to = self.phase;
        let visible = resume_to != SessionPhase::Planning;
        if visible {
            self.transition(SessionPhase::Paused).await?;
        }
        info!(session_id = %self.id(), phase = %resume_to, "session paused");

        if self.signal.wait_until_resumed().await {
            return Err(PipelineError::SessionAborted);
        }
        if visible {
            self.transition(resume_to).await?;
        }
        info!(session_id = %self.id(), phase = %resume_to, "session resumed");
        Ok(())
    }

    /// Record why the session stopped. Returns the phase actually reached.
    ///
    /// A released session is left `paused` (or `planning`) with its
    /// completed work intact; anything else moves to `failed`.
    async fn finish_with(&mut self, err: PipelineError) -> SessionPhase {
        if err.is_abort() {
            info!(session_id = %self.id(), phase = %self.phase, "session released");
            if matches!(self.phase, SessionPhase::Drafting | SessionPhase::Revising) {
                if let Err(e) = self.transition(SessionPhase::Paused).await {
                    error!(session_id = %self.id(), error = %e, "failed to record paused phase");
                }
            }
            return self.phase;
        }

        error!(session_id = %self.id(), phase = %self.phase, error = %err, "session failed");
        let failure = FailureInfo {
            phase: self.phase,
            reason: err.to_string(),
        };
        if let Err(e) = session_db::record_failure(&self.store, self.id(), failure).await {
            error!(session_id = %self.id(), error = %e, "failed to record session failure");
        }
        if self.phase.is_terminal() {
            return self.phase;
        }
        match self.transition(SessionPhase::Failed).await {
            Ok(()) => SessionPhase::Failed,
            Err(e) => {
                error!(session_id = %self.id(), error = %e, "failed to record terminal phase");
                self.phase
            }
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Deliver an event once the store is up to date.
    ///
    /// Waits for queue space unless the session is interrupted, in which
    /// case the event is dropped. A dropped receiver is not an error.
    async fn emit(&self, event: SessionEvent) {
        tokio::select! {
            biased;
            _ = self.events.send(event) => {}
            _ = self.signal.interrupted() => {
                debug!(session_id = %self.id(), "event queue full while interrupted, event dropped");
            }
        }
    }

    /// Queue the final event without waiting for the consumer.
    fn announce_finished(&self, phase: SessionPhase) {
        match self.events.try_send(SessionEvent::Finished { phase }) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let _ = events.send(event).await;
                });
            }
        }
    }

    async fn flush(&self) {
        if let Err(e) = self.store.flush_session(self.id()).await {
            warn!(session_id = %self.id(), error = %e, "failed to write session snapshot");
        }
    }

    async fn outcome(&self, phase: SessionPhase) -> SessionOutcome {
        let (mode, sections, summary, failure) = match self.store.snapshot(self.id()).await {
            Ok(snapshot) => {
                let summary = snapshot
                    .current_summary()
                    .cloned()
                    .unwrap_or_else(GlobalSummary::empty);
                (
                    snapshot.session.mode,
                    snapshot.sections,
                    summary,
                    snapshot.session.failure,
                )
            }
            Err(e) => {
                error!(session_id = %self.id(), error = %e, "session vanished from the store");
                (None, Vec::new(), GlobalSummary::empty(), None)
            }
        };
        SessionOutcome {
            session_id: self.id(),
            document_id: self.session.document_id,
            phase,
            mode,
            sections,
            summary,
            report: self.report.clone(),
            failure,
        }
    }
}
