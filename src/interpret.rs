//! Interpretation requester: registry entries -> explanations
//!
//! Each selected feature with evidence becomes one interpreter call. Calls
//! run on a `JoinSet`, gated by a `Semaphore` of `max_concurrency` permits,
//! each under `tokio::time::timeout`. Failures are recorded on the entry and
//! never abort the batch; results are written back by feature id, so
//! completion order does not matter.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ExtractConfig, SelectionPolicy};
use crate::error::SaeResult;
use crate::interpreter::{Interpreter, InterpreterError};
use crate::prompt::{parse_explanation, parse_percent, ParsedExplanation, Prompt, PromptBuilder, PromptType};
use crate::registry::{ExampleActivation, FailureKind, FeatureEntry, FeatureRegistry, Interpretation};

/// Counts for one interpretation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterpretationSummary {
    pub selected: usize,
    /// Features that reached the interpreter
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub no_examples: usize,
    /// Failures where no attempt got any answer (transport errors or timeouts)
    pub unanswered: usize,
}

impl InterpretationSummary {
    /// Every attempted feature failed without a single response.
    pub fn is_unreachable(&self) -> bool {
        self.attempted > 0 && self.unanswered == self.attempted
    }
}

/// Timeout and retry settings shared by every call.
#[derive(Debug, Clone, Copy)]
struct CallPolicy {
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

enum CallOutcome {
    Explained {
        parsed: ParsedExplanation,
        confidence: Option<f32>,
    },
    Failed(CallError),
}

/// Final error of a call plus whether any attempt got a response.
struct CallError {
    error: InterpreterError,
    attempts: u32,
    answered: bool,
}

impl CallError {
    fn unanswered(error: InterpreterError, attempts: u32) -> Self {
        Self {
            error,
            attempts,
            answered: false,
        }
    }
}

/// No response at all: the endpoint was never reached or never replied.
fn is_silent(error: &InterpreterError) -> bool {
    matches!(
        error,
        InterpreterError::Transport(_) | InterpreterError::Timeout(_)
    )
}

/// Pick feature ids for interpretation under `policy`.
pub fn select_features(
    registry: &FeatureRegistry,
    policy: SelectionPolicy,
    max_features: usize,
    skip_explained: bool,
) -> Vec<usize> {
    let mut candidates: Vec<_> = registry
        .entries()
        .filter(|e| !(skip_explained && e.interpretation.is_explained()))
        .collect();
    // Entries arrive in ascending id order; stable sorts keep it for ties.
    match policy {
        SelectionPolicy::RegistryOrder => {}
        SelectionPolicy::ByMaxActivation => candidates
            .sort_by(|a, b| b.stats.max_activation.total_cmp(&a.stats.max_activation)),
        SelectionPolicy::ByDensity => {
            candidates.sort_by(|a, b| b.stats.density.total_cmp(&a.stats.density))
        }
    }
    candidates
        .into_iter()
        .take(max_features)
        .map(|e| e.feature_id)
        .collect()
}

/// Drives interpreter calls for a registry.
pub struct InterpretationRequester {
    interpreter: Arc<dyn Interpreter>,
    config: ExtractConfig,
    prompts: PromptBuilder,
}

impl InterpretationRequester {
    pub fn new(interpreter: Arc<dyn Interpreter>, config: ExtractConfig) -> Self {
        Self {
            interpreter,
            config,
            prompts: PromptBuilder::new(),
        }
    }

    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Interpret the selected entries of `registry` and return it enriched.
    pub async fn interpret(
        &self,
        mut registry: FeatureRegistry,
    ) -> SaeResult<(FeatureRegistry, InterpretationSummary)> {
        self.config.validate()?;
        let cfg = &self.config;
        let selected = select_features(&registry, cfg.selection, cfg.max_features, cfg.skip_explained);
        let mut summary = InterpretationSummary {
            selected: selected.len(),
            ..Default::default()
        };
        info!(
            "Interpreting {} features with {} ({}, policy={:?}, concurrency={})",
            selected.len(),
            self.interpreter.model(),
            cfg.prompt_type,
            cfg.selection,
            cfg.max_concurrency
        );

        let policy = CallPolicy {
            timeout: cfg.call_timeout,
            max_retries: cfg.max_retries,
            backoff: cfg.retry_backoff,
        };
        let semaphore = Arc::new(Semaphore::new(cfg.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut outstanding = BTreeSet::new();

        for feature_id in selected {
            let Some(entry) = registry.get(feature_id) else {
                continue;
            };
            if entry.is_dead() {
                debug!("Feature {feature_id} has no examples, skipping call");
                registry.set_interpretation(feature_id, Interpretation::NoExamples)?;
                summary.no_examples += 1;
                continue;
            }

            let prompt = self.prompts.build(entry, cfg.prompt_type, cfg.top_k);
            let scoring = self.scoring_prompts(entry);
            let interpreter = Arc::clone(&self.interpreter);
            let semaphore = Arc::clone(&semaphore);
            let prompt_type = cfg.prompt_type;
            summary.attempted += 1;
            outstanding.insert(feature_id);

            tasks.spawn(async move {
                // Closed semaphores never happen here; treat it as a transport failure.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(e) => {
                        return (
                            feature_id,
                            CallOutcome::Failed(CallError::unanswered(
                                InterpreterError::Transport(e.to_string()),
                                0,
                            )),
                        )
                    }
                };
                let outcome =
                    interpret_one(interpreter.as_ref(), &prompt, prompt_type, scoring, policy).await;
                (feature_id, outcome)
            });
        }

        let model = self.interpreter.model().to_string();
        let mut task_errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (feature_id, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Interpretation task failed: {e}");
                    task_errors.push(e.to_string());
                    continue;
                }
            };
            outstanding.remove(&feature_id);
            let interpretation = match outcome {
                CallOutcome::Explained { parsed, confidence } => {
                    summary.succeeded += 1;
                    debug!("Feature {feature_id}: {}", parsed.explanation);
                    Interpretation::Explained {
                        explanation: parsed.explanation,
                        label: parsed.label,
                        attributes: parsed.attributes,
                        confidence,
                        model: model.clone(),
                        at: Utc::now(),
                    }
                }
                CallOutcome::Failed(CallError {
                    error,
                    attempts,
                    answered,
                }) => {
                    summary.failed += 1;
                    if !answered {
                        summary.unanswered += 1;
                    }
                    warn!(
                        feature_id,
                        attempts,
                        error = %error,
                        "Interpretation failed"
                    );
                    Interpretation::Failed {
                        kind: error.kind(),
                        reason: error.to_string(),
                        attempts,
                        at: Utc::now(),
                    }
                }
            };
            registry.set_interpretation(feature_id, interpretation)?;
        }

        // Tasks that panicked or were cancelled never reported their id.
        for feature_id in outstanding {
            let reason = task_errors
                .pop()
                .unwrap_or_else(|| "interpretation task did not complete".to_string());
            warn!(feature_id, error = %reason, "Interpretation task lost");
            summary.failed += 1;
            registry.set_interpretation(
                feature_id,
                Interpretation::Failed {
                    kind: FailureKind::Internal,
                    reason,
                    attempts: 0,
                    at: Utc::now(),
                },
            )?;
        }

        info!(
            "Interpretation done: {} succeeded, {} failed, {} without examples",
            summary.succeeded, summary.failed, summary.no_examples
        );
        Ok((registry, summary))
    }

    /// (high, low) scoring prompts, when scoring is enabled and possible.
    fn scoring_prompts(&self, entry: &FeatureEntry) -> Option<ScoringPrompts> {
        if !self.config.score_interpretations
            || self.config.prompt_type != PromptType::Structured
            || entry.contrast_examples.is_empty()
        {
            return None;
        }
        let k = self.config.top_k;
        let high: Vec<_> = entry.top_examples.iter().take(k).cloned().collect();
        let low: Vec<_> = entry.contrast_examples.iter().take(k).cloned().collect();
        Some(ScoringPrompts {
            builder: self.prompts.clone(),
            high,
            low,
        })
    }
}

struct ScoringPrompts {
    builder: PromptBuilder,
    high: Vec<ExampleActivation>,
    low: Vec<ExampleActivation>,
}

async fn interpret_one(
    interpreter: &dyn Interpreter,
    prompt: &Prompt,
    prompt_type: PromptType,
    scoring: Option<ScoringPrompts>,
    policy: CallPolicy,
) -> CallOutcome {
    let (text, attempts) = match call_with_retry(interpreter, prompt, policy).await {
        Ok(ok) => ok,
        Err(failure) => return CallOutcome::Failed(failure),
    };
    let parsed = match parse_explanation(&text, prompt_type) {
        Ok(parsed) => parsed,
        Err(error) => {
            return CallOutcome::Failed(CallError {
                error,
                attempts,
                answered: true,
            })
        }
    };

    let confidence = match scoring {
        Some(scoring) if !parsed.attributes.is_empty() => {
            match score(interpreter, &scoring, &parsed.attributes, policy).await {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(error = %e, "Scoring failed, leaving confidence unset");
                    None
                }
            }
        }
        _ => None,
    };
    CallOutcome::Explained { parsed, confidence }
}

/// `|high% - low%| / 100`
async fn score(
    interpreter: &dyn Interpreter,
    scoring: &ScoringPrompts,
    attributes: &[String],
    policy: CallPolicy,
) -> Result<f32, InterpreterError> {
    let high_prompt = scoring.builder.build_scoring(attributes, &scoring.high);
    let low_prompt = scoring.builder.build_scoring(attributes, &scoring.low);
    let high = parse_percent(&call_with_retry(interpreter, &high_prompt, policy).await.map_err(|f| f.error)?.0)?;
    let low = parse_percent(&call_with_retry(interpreter, &low_prompt, policy).await.map_err(|f| f.error)?.0)?;
    Ok((high - low).abs() / 100.0)
}

/// One call plus up to `max_retries` retries for retryable errors, with
/// `backoff * 2^n` between attempts. Returns the attempt count either way.
async fn call_with_retry(
    interpreter: &dyn Interpreter,
    prompt: &Prompt,
    policy: CallPolicy,
) -> Result<(String, u32), CallError> {
    let mut attempts = 0u32;
    let mut answered = false;
    loop {
        let result = match tokio::time::timeout(policy.timeout, interpreter.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(InterpreterError::Timeout(policy.timeout)),
        };
        attempts += 1;
        if let Err(e) = &result {
            answered |= !is_silent(e);
        }
        match result {
            Ok(text) => return Ok((text, attempts)),
            Err(e) if e.is_retryable() && attempts <= policy.max_retries => {
                let delay = policy.backoff * 2u32.saturating_pow(attempts - 1);
                debug!("Attempt {attempts} failed ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return Err(CallError {
                    error,
                    attempts,
                    answered,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FeatureStats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers structured prompts from the feature id in the prompt.
    #[derive(Default)]
    struct ScriptedInterpreter {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        hang_on: Option<usize>,
        panic_on: Option<usize>,
        silent: bool,
        transport_down: bool,
        flaky_first: AtomicUsize,
    }

    fn feature_of(prompt: &Prompt) -> Option<usize> {
        let rest = prompt.user.strip_prefix("Feature ")?;
        rest.split_whitespace().next()?.parse().ok()
    }

    #[async_trait]
    impl Interpreter for ScriptedInterpreter {
        async fn complete(&self, prompt: &Prompt) -> Result<String, InterpreterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.silent {
                std::future::pending::<()>().await;
            }
            if self.transport_down {
                return Err(InterpreterError::Transport("connection refused".into()));
            }
            if self.flaky_first.load(Ordering::SeqCst) > 0 {
                self.flaky_first.fetch_sub(1, Ordering::SeqCst);
                return Err(InterpreterError::RateLimited("busy".into()));
            }
            if prompt.user.starts_with("Attributes:") {
                let percent = if prompt.user.contains("hot") { 90 } else { 10 };
                return Ok(format!("{{\"percent\": {percent}}}"));
            }
            let id = feature_of(prompt).unwrap();
            if self.hang_on == Some(id) {
                std::future::pending::<()>().await;
            }
            if self.panic_on == Some(id) {
                panic!("interpreter crashed on feature {id}");
            }
            Ok(format!(
                "```json\n{{\"label\": \"f{id}\", \"reasoning\": \"concept {id}\", \"attributes\": [\"a{id}\"]}}\n```"
            ))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn entry(id: usize, max: f32, density: f32) -> FeatureEntry {
        FeatureEntry {
            feature_id: id,
            top_examples: if max > 0.0 {
                vec![ExampleActivation {
                    example_id: id as u64,
                    activation: max,
                    text: Some(format!("hot {id}")),
                }]
            } else {
                vec![]
            },
            stats: FeatureStats {
                max_activation: max,
                mean_activation: 0.0,
                density,
            },
            contrast_examples: vec![ExampleActivation {
                example_id: 1000,
                activation: 0.0,
                text: Some("cold".into()),
            }],
            interpretation: Interpretation::Pending,
        }
    }

    fn config() -> ExtractConfig {
        ExtractConfig {
            max_features: 10,
            call_timeout: Duration::from_millis(200),
            max_retries: 1,
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn registry(n: usize) -> FeatureRegistry {
        FeatureRegistry::from_entries((0..n).map(|i| entry(i, 1.0 + i as f32, 0.1)))
    }

    #[tokio::test]
    async fn test_one_timeout_does_not_fail_batch() {
        let interp = Arc::new(ScriptedInterpreter {
            hang_on: Some(7),
            ..Default::default()
        });
        let requester = InterpretationRequester::new(interp, config());
        let (registry, summary) = requester.interpret(registry(10)).await.unwrap();

        assert_eq!(summary.succeeded, 9);
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_unreachable());
        match &registry.get(7).unwrap().interpretation {
            Interpretation::Failed { kind, attempts, .. } => {
                assert_eq!(*kind, FailureKind::Timeout);
                assert_eq!(*attempts, 2);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(registry.summary().explained, 9);
        assert_eq!(
            registry.get(3).unwrap().interpretation.explanation(),
            Some("concept 3")
        );
    }

    #[tokio::test]
    async fn test_dead_feature_marked_without_call() {
        let interp = Arc::new(ScriptedInterpreter::default());
        let input = FeatureRegistry::from_entries([entry(0, 2.0, 0.1), entry(1, 0.0, 0.0)]);
        let requester = InterpretationRequester::new(interp.clone(), config());
        let (registry, summary) = requester.interpret(input).await.unwrap();

        assert_eq!(interp.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.no_examples, 1);
        assert_eq!(summary.attempted, 1);
        assert_eq!(registry.get(1).unwrap().interpretation, Interpretation::NoExamples);
    }

    #[tokio::test]
    async fn test_unreachable_when_all_transport() {
        let interp = Arc::new(ScriptedInterpreter {
            transport_down: true,
            ..Default::default()
        });
        let cfg = ExtractConfig {
            max_retries: 0,
            ..config()
        };
        let (registry, summary) = InterpretationRequester::new(interp, cfg)
            .interpret(registry(3))
            .await
            .unwrap();
        assert!(summary.is_unreachable());
        assert_eq!(registry.summary().failed, 3);
    }

    #[tokio::test]
    async fn test_unreachable_when_every_call_times_out() {
        let interp = Arc::new(ScriptedInterpreter {
            silent: true,
            ..Default::default()
        });
        let cfg = ExtractConfig {
            max_retries: 0,
            call_timeout: Duration::from_millis(20),
            ..config()
        };
        let (registry, summary) = InterpretationRequester::new(interp, cfg)
            .interpret(registry(3))
            .await
            .unwrap();
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.failed, 3);
        assert!(summary.is_unreachable());
        assert_eq!(registry.summary().failed, 3);
    }

    #[tokio::test]
    async fn test_rate_limited_then_timeout_is_not_unreachable() {
        let interp = Arc::new(ScriptedInterpreter {
            flaky_first: AtomicUsize::new(1),
            hang_on: Some(0),
            ..Default::default()
        });
        let cfg = ExtractConfig {
            call_timeout: Duration::from_millis(20),
            ..config()
        };
        let (_, summary) = InterpretationRequester::new(interp, cfg)
            .interpret(registry(1))
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.unanswered, 0);
        assert!(!summary.is_unreachable());
    }

    #[tokio::test]
    async fn test_panicking_call_marks_entry_failed() {
        let interp = Arc::new(ScriptedInterpreter {
            panic_on: Some(7),
            ..Default::default()
        });
        let (registry, summary) = InterpretationRequester::new(interp, config())
            .interpret(registry(10))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 9);
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_unreachable());
        match &registry.get(7).unwrap().interpretation {
            Interpretation::Failed { kind, reason, .. } => {
                assert_eq!(*kind, FailureKind::Internal);
                assert!(reason.contains("panic"), "{reason}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(registry.summary().failed, summary.failed);
    }

    #[tokio::test]
    async fn test_retry_recovers_rate_limit() {
        let interp = Arc::new(ScriptedInterpreter {
            flaky_first: AtomicUsize::new(1),
            ..Default::default()
        });
        let cfg = ExtractConfig {
            max_concurrency: 1,
            ..config()
        };
        let (_, summary) = InterpretationRequester::new(interp.clone(), cfg)
            .interpret(registry(2))
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(interp.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let interp = Arc::new(ScriptedInterpreter::default());
        let cfg = ExtractConfig {
            max_concurrency: 2,
            ..config()
        };
        InterpretationRequester::new(interp.clone(), cfg)
            .interpret(registry(8))
            .await
            .unwrap();
        assert!(interp.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(interp.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_scoring_sets_confidence() {
        let interp = Arc::new(ScriptedInterpreter::default());
        let cfg = ExtractConfig {
            score_interpretations: true,
            ..config()
        };
        let (registry, _) = InterpretationRequester::new(interp, cfg)
            .interpret(registry(1))
            .await
            .unwrap();
        match &registry.get(0).unwrap().interpretation {
            Interpretation::Explained { confidence, label, .. } => {
                assert!((confidence.unwrap() - 0.8).abs() < 1e-6);
                assert_eq!(label.as_deref(), Some("f0"));
            }
            other => panic!("expected explanation, got {other:?}"),
        }
    }

    #[test]
    fn test_selection_policies() {
        let registry = FeatureRegistry::from_entries([
            entry(0, 1.0, 0.5),
            entry(1, 3.0, 0.1),
            entry(2, 3.0, 0.9),
            entry(3, 2.0, 0.5),
        ]);
        assert_eq!(
            select_features(&registry, SelectionPolicy::RegistryOrder, 3, false),
            vec![0, 1, 2]
        );
        assert_eq!(
            select_features(&registry, SelectionPolicy::ByMaxActivation, 3, false),
            vec![1, 2, 3]
        );
        assert_eq!(
            select_features(&registry, SelectionPolicy::ByDensity, 4, false),
            vec![2, 0, 3, 1]
        );
    }

    #[tokio::test]
    async fn test_skip_explained() {
        let interp = Arc::new(ScriptedInterpreter::default());
        let (first, _) = InterpretationRequester::new(interp.clone(), config())
            .interpret(registry(2))
            .await
            .unwrap();
        let mut next = first.merge(FeatureRegistry::from_entries([entry(5, 1.0, 0.1)]));
        next.set_interpretation(1, Interpretation::Pending).unwrap();

        let cfg = ExtractConfig {
            skip_explained: true,
            ..config()
        };
        assert_eq!(
            select_features(&next, cfg.selection, cfg.max_features, cfg.skip_explained),
            vec![1, 5]
        );
    }
}
