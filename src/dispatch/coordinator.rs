//! The dispatch coordinator.
//!
//! Flow: normalize → analyze → retrieve → dispatch (concurrent fan-out) →
//! synthesize → persist → respond. Only an unexpected failure (including a
//! panic) produces an `error` response; every step has a fallback.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::join_all;
use serde_json::json;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::dispatch::analysis::{
    build_analysis_system_prompt, build_analysis_user_prompt, parse_analysis,
};
use crate::dispatch::collaboration::{
    CollaborationState, CollaborationStatus, CollaborationTable, ExpertOutcome,
};
use crate::dispatch::synthesis::{
    ExpertAnswer, build_synthesis_system_prompt, build_synthesis_user_prompt, fallback_answer,
};
use crate::dispatch::types::{
    Analysis, DispatchRequest, DispatchResponse, ResponseMetadata, ResponseStatus, SkipReason,
    SkippedExpert, Stage,
};
use crate::error::{DispatchError, ExpertError};
use crate::experts::registry::panic_message;
use crate::experts::{Expert, ExpertFilter, ExpertRequest, ExpertResponse, WorkerRegistry};
use crate::knowledge::{Collection, KnowledgeStore, Metadata, RecordContent, SearchHit};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, completion_cost};
use crate::metrics::{MetricsSink, NoopMetrics};

/// Agent label used for metrics.
const AGENT: &str = "coordinator";

/// Collections consulted during retrieval.
const RETRIEVAL_COLLECTIONS: [Collection; 2] =
    [Collection::ProblemSolutions, Collection::CollaborationHistory];

const NO_INPUT_MESSAGE: &str = "Please provide a question so the experts can help.";
const ERROR_MESSAGE: &str = "Sorry, something went wrong while processing your request.";

/// Result of one expert call, once settled.
struct ExpertCall {
    expert: String,
    result: Result<ExpertResponse, ExpertError>,
    elapsed_ms: u64,
}

/// Routes questions to experts and merges their answers.
pub struct Coordinator {
    registry: Arc<WorkerRegistry>,
    knowledge: Arc<KnowledgeStore>,
    llm: Arc<dyn LlmProvider>,
    metrics: Arc<dyn MetricsSink>,
    collaborations: CollaborationTable,
    config: DispatchConfig,
}

impl Coordinator {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        knowledge: Arc<KnowledgeStore>,
        llm: Arc<dyn LlmProvider>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            knowledge,
            llm,
            metrics: Arc::new(NoopMetrics),
            collaborations: CollaborationTable::new(config.retention),
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn collaborations(&self) -> &CollaborationTable {
        &self.collaborations
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Handle one request. Always returns a response.
    pub async fn handle(&self, request: impl Into<DispatchRequest>) -> DispatchResponse {
        let request = request.into();
        let started = Instant::now();
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let response = if request.is_empty() {
            tracing::debug!(correlation_id = %correlation_id, stage = %Stage::NoInput, "Empty question");
            DispatchResponse {
                content: NO_INPUT_MESSAGE.to_string(),
                metadata: ResponseMetadata::new(&request, correlation_id, ResponseStatus::NoInput),
            }
        } else {
            let span = tracing::info_span!(
                "dispatch",
                correlation_id = %correlation_id,
                tenant_id = %request.tenant_id
            );
            let interaction_id = Uuid::new_v4();
            let outcome = AssertUnwindSafe(self.run(&request, &correlation_id, interaction_id))
                .catch_unwind()
                .instrument(span)
                .await;
            let message = match outcome {
                Ok(Ok(response)) => return self.finish(response, started),
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            let mut response = self.error_response(&request, correlation_id, message.clone());
            if self.collaborations.fail(interaction_id, &message).await {
                response.metadata.interaction_id = Some(interaction_id);
                response.metadata.collaboration_status = Some(CollaborationStatus::Failed);
            }
            response
        };
        self.finish(response, started)
    }

    fn finish(&self, response: DispatchResponse, started: Instant) -> DispatchResponse {
        let status = match response.metadata.status {
            ResponseStatus::Success => "success",
            ResponseStatus::NoInput => "no_input",
            ResponseStatus::Error => "error",
        };
        self.metrics
            .record_request(AGENT, status, started.elapsed());
        response
    }

    fn error_response(
        &self,
        request: &DispatchRequest,
        correlation_id: String,
        message: String,
    ) -> DispatchResponse {
        tracing::error!(
            correlation_id = %correlation_id,
            stage = %Stage::Error,
            error = %message,
            "Dispatch failed"
        );
        let mut metadata = ResponseMetadata::new(request, correlation_id, ResponseStatus::Error);
        metadata.error = Some(message);
        DispatchResponse {
            content: ERROR_MESSAGE.to_string(),
            metadata,
        }
    }

    async fn run(
        &self,
        request: &DispatchRequest,
        correlation_id: &str,
        interaction_id: Uuid,
    ) -> Result<DispatchResponse, DispatchError> {
        let started = Instant::now();
        let question = request.text.trim();
        let tenant_id = request.tenant_id.as_str();
        tracing::debug!(stage = %Stage::Received, "Dispatch started");

        // Analyze
        let analysis = match self.analyze(question).await {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(error = %e, "Analysis failed, using default experts");
                Analysis::fallback(&self.config.default_experts, &e.to_string())
            }
        };
        tracing::debug!(
            stage = %Stage::Analyzed,
            experts = ?analysis.required_experts,
            complexity = %analysis.complexity,
            fallback = analysis.fallback,
            "Question analyzed"
        );

        // Retrieve
        let knowledge = self.retrieve(tenant_id, question).await;
        self.metrics.record_retrieval_hits(AGENT, knowledge.len());
        tracing::debug!(stage = %Stage::Retrieved, hits = knowledge.len(), "Knowledge retrieved");

        // Dispatch
        let mut state = CollaborationState::new(
            correlation_id,
            tenant_id,
            question,
            analysis.required_experts.clone(),
        )
        .with_interaction_id(interaction_id);
        let launched = self.resolve_experts(&analysis, &mut state);
        let skipped = state.skipped.clone();
        self.collaborations.insert(state).await;
        let guard = self.collaborations.settle_guard(interaction_id);

        let expert_request = ExpertRequest {
            question: question.to_string(),
            tenant_id: tenant_id.to_string(),
            context: expert_context(&analysis, &knowledge, correlation_id),
        };
        let calls = join_all(
            launched
                .iter()
                .map(|(name, expert)| self.call_expert(name, expert.as_ref(), &expert_request)),
        )
        .await;

        let answers: Vec<ExpertAnswer> = calls
            .iter()
            .filter_map(|call| {
                call.result.as_ref().ok().map(|response| ExpertAnswer {
                    expert: call.expert.clone(),
                    content: response.content.clone(),
                })
            })
            .collect();
        let experts_involved: Vec<String> = calls.iter().map(|c| c.expert.clone()).collect();

        let recorded = self
            .collaborations
            .update(interaction_id, |state| {
                for call in calls {
                    match call.result {
                        Ok(response) => {
                            state.record_success(&call.expert, response, call.elapsed_ms)
                        }
                        Err(e) => {
                            let outcome = match e {
                                ExpertError::Timeout { .. } => ExpertOutcome::TimedOut,
                                _ => ExpertOutcome::Failed,
                            };
                            state.record_failure(&call.expert, outcome, e.to_string(), call.elapsed_ms);
                        }
                    }
                }
                state.complete();
            })
            .await;
        guard.disarm();
        if !recorded {
            return Err(DispatchError::Unexpected(format!(
                "collaboration {interaction_id} disappeared during dispatch"
            )));
        }
        tracing::info!(
            stage = %Stage::Dispatched,
            interaction_id = %interaction_id,
            dispatched = experts_involved.len(),
            answered = answers.len(),
            skipped = skipped.len(),
            "Experts settled"
        );

        // Synthesize
        let content = match self.synthesize(question, &analysis, &answers).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(error = %e, "Synthesis failed, using template answer");
                fallback_answer(question, &answers)
            }
        };
        tracing::debug!(stage = %Stage::Synthesized, chars = content.len(), "Answer synthesized");

        // Persist
        if let Err(e) = self
            .persist(
                tenant_id,
                question,
                &content,
                interaction_id,
                correlation_id,
                &analysis,
                &experts_involved,
                &answers,
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to persist collaboration knowledge");
        } else {
            tracing::debug!(stage = %Stage::Stored, "Knowledge persisted");
        }

        let mut metadata =
            ResponseMetadata::new(request, correlation_id.to_string(), ResponseStatus::Success);
        metadata.experts_involved = experts_involved;
        metadata.experts_skipped = skipped;
        metadata.complexity = Some(analysis.complexity);
        metadata.interaction_id = Some(interaction_id);
        metadata.knowledge_used = knowledge.len();
        metadata.collaboration_status = Some(CollaborationStatus::Completed);

        tracing::info!(
            stage = %Stage::Done,
            interaction_id = %interaction_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatch complete"
        );
        Ok(DispatchResponse { content, metadata })
    }

    async fn analyze(&self, question: &str) -> Result<Analysis, DispatchError> {
        let available = self.registry.list(&ExpertFilter::default());
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_analysis_system_prompt(&available)),
            ChatMessage::user(build_analysis_user_prompt(question)),
        ])
        .with_max_tokens(self.config.analysis_max_tokens)
        .with_temperature(self.config.analysis_temperature);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| DispatchError::Analysis(e.to_string()))?;
        parse_analysis(&response.content).map_err(DispatchError::Analysis)
    }

    /// Similar records from every retrieval collection, best first.
    async fn retrieve(&self, tenant_id: &str, question: &str) -> Vec<SearchHit> {
        let searches = RETRIEVAL_COLLECTIONS.iter().map(|collection| async move {
            self.knowledge
                .try_search(
                    *collection,
                    tenant_id,
                    question,
                    self.config.retrieval_top_k,
                    self.config.retrieval_threshold,
                )
                .await
                .map_err(|e| DispatchError::Retrieval(format!("{collection}: {e}")))
        });

        let mut hits = Vec::new();
        for result in join_all(searches).await {
            match result {
                Ok(found) => hits.extend(found),
                Err(e) => tracing::warn!(error = %e, "Retrieval failed, continuing without it"),
            }
        }
        hits.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
        hits.truncate(self.config.retrieval_top_k);
        hits
    }

    /// Resolve required experts. Unknown, disabled and factory-less experts
    /// are recorded as skipped; duplicates resolve once.
    fn resolve_experts(
        &self,
        analysis: &Analysis,
        state: &mut CollaborationState,
    ) -> Vec<(String, Arc<dyn Expert>)> {
        let mut launched: Vec<(String, Arc<dyn Expert>)> = Vec::new();
        for requested in &analysis.required_experts {
            let reason = match self.registry.get(requested, true) {
                None => SkipReason::NotFound,
                Some(descriptor) if !descriptor.enabled => SkipReason::Disabled,
                Some(descriptor) => {
                    if launched.iter().any(|(name, _)| *name == descriptor.name) {
                        continue;
                    }
                    match descriptor.instantiate() {
                        Some(expert) => {
                            state.launch(&descriptor.name);
                            launched.push((descriptor.name.clone(), expert));
                            continue;
                        }
                        None => SkipReason::NoFactory,
                    }
                }
            };
            tracing::info!(expert = %requested, reason = ?reason, "Skipping expert");
            state.skip(SkippedExpert {
                name: requested.clone(),
                reason,
            });
        }
        launched
    }

    /// One bounded expert call. Timeouts, errors and panics become sentinels.
    async fn call_expert(
        &self,
        name: &str,
        expert: &dyn Expert,
        request: &ExpertRequest,
    ) -> ExpertCall {
        let started = Instant::now();
        let timeout = self.config.expert_timeout;
        let call = AssertUnwindSafe(expert.respond(request)).catch_unwind();

        let result = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ExpertError::Panicked {
                name: name.to_string(),
                reason: panic_message(panic.as_ref()),
            }),
            Err(_) => Err(ExpertError::Timeout {
                name: name.to_string(),
                timeout,
            }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::debug!(expert = name, elapsed_ms, "Expert answered"),
            Err(e) => tracing::warn!(expert = name, elapsed_ms, error = %e, "Expert call failed"),
        }
        ExpertCall {
            expert: name.to_string(),
            result,
            elapsed_ms,
        }
    }

    async fn synthesize(
        &self,
        question: &str,
        analysis: &Analysis,
        answers: &[ExpertAnswer],
    ) -> Result<String, DispatchError> {
        if answers.is_empty() {
            return Err(DispatchError::Synthesis("no expert answered".into()));
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_synthesis_system_prompt()),
            ChatMessage::user(build_synthesis_user_prompt(question, analysis, answers)),
        ])
        .with_max_tokens(self.config.synthesis_max_tokens)
        .with_temperature(self.config.synthesis_temperature);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| DispatchError::Synthesis(e.to_string()))?;
        self.metrics
            .record_synthesis_tokens(AGENT, response.total_tokens());
        tracing::debug!(
            model = self.llm.model_name(),
            tokens = response.total_tokens(),
            cost = %completion_cost(self.llm.as_ref(), &response),
            "Synthesis completion"
        );

        let content = response.content.trim();
        if content.is_empty() {
            return Err(DispatchError::Synthesis("empty completion".into()));
        }
        Ok(content.to_string())
    }

    /// Write the collaboration and the solved problem. Every write is
    /// attempted; the first failure is reported.
    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        tenant_id: &str,
        question: &str,
        answer: &str,
        interaction_id: Uuid,
        correlation_id: &str,
        analysis: &Analysis,
        experts: &[String],
        answers: &[ExpertAnswer],
    ) -> Result<(), DispatchError> {
        let mut writes: Vec<(RecordContent, Metadata)> = vec![
            (
                RecordContent::CollaborationHistory {
                    interaction_id: interaction_id.to_string(),
                    participants: experts.to_vec(),
                    task_description: question.to_string(),
                    outcome: Some(CollaborationStatus::Completed.to_string()),
                },
                metadata(json!({
                    "correlation_id": correlation_id,
                    "complexity": analysis.complexity,
                    "keywords": analysis.keywords,
                })),
            ),
            (
                RecordContent::ProblemSolution {
                    problem: question.to_string(),
                    solution: answer.to_string(),
                },
                metadata(json!({
                    "interaction_id": interaction_id.to_string(),
                    "experts": experts,
                })),
            ),
        ];

        if self.config.store_expert_knowledge {
            let topic = if analysis.keywords.is_empty() {
                question.to_string()
            } else {
                analysis.keywords.join(", ")
            };
            for answer in answers {
                writes.push((
                    RecordContent::ExpertKnowledge {
                        expert_name: answer.expert.clone(),
                        topic: topic.clone(),
                        content: answer.content.clone(),
                    },
                    metadata(json!({ "interaction_id": interaction_id.to_string() })),
                ));
            }
        }

        let mut first_error = None;
        for (content, meta) in writes {
            let collection = content.collection();
            if let Err(e) = self
                .knowledge
                .store(tenant_id, content, Some(meta), None)
                .await
            {
                tracing::warn!(collection = %collection, error = %e, "Knowledge write failed");
                if first_error.is_none() {
                    first_error = Some(DispatchError::Storage(format!("{collection}: {e}")));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Context handed to every expert.
fn expert_context(analysis: &Analysis, knowledge: &[SearchHit], correlation_id: &str) -> serde_json::Value {
    let knowledge: Vec<serde_json::Value> = knowledge
        .iter()
        .map(|hit| {
            json!({
                "collection": hit.collection,
                "similarity_score": hit.similarity_score,
                "summary": hit.content.summary(),
            })
        })
        .collect();
    json!({
        "correlation_id": correlation_id,
        "analysis": {
            "complexity": analysis.complexity,
            "keywords": analysis.keywords,
            "reasoning": analysis.reasoning,
        },
        "knowledge": knowledge,
    })
}

fn metadata(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}
