//! Per-step delegate: the step's only channel to the build log, credentials,
//! policy engine and image fetching.

use std::sync::Arc;

use build_ledger::{
    Build, BuildEvent, ErrorEvent, FinishEvent, InitializeEvent, Origin, PlanId,
    SelectedWorkerEvent, StartEvent, TracingAttrs, UsedResourceCache,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use crate::clock::Clock;
use crate::context::StepContext;
use crate::error::{DelegateError, DelegateResult, ExecError};
use crate::image::{ArtifactSourcer, GetResult, ImageSpec};
use crate::obs;
use crate::output::{EventWriter, OutputFilter};
use crate::plan::{Plan, Source};
use crate::policy::{PolicyCheckInput, PolicyChecker, ACTION_USE_IMAGE};
use crate::redact::redact;
use crate::scope::{ArtifactName, RunState};
use crate::variables::StepVariables;
use crate::vars::{CredentialStore, VarSourceConfigs};

/// Delegate for one step execution.
///
/// Not shared between steps. The output streams are created on first use and
/// kept for the rest of the step so their line buffering survives across
/// writes; `&mut self` on the accessors keeps first use single-threaded.
pub struct BuildStepDelegate {
    pub(crate) build: Arc<dyn Build>,
    pub(crate) plan_id: PlanId,
    pub(crate) state: Arc<dyn RunState>,
    pub(crate) clock: Arc<dyn Clock>,
    stdout: Option<EventWriter>,
    stderr: Option<EventWriter>,
    policy_checker: Arc<dyn PolicyChecker>,
    pub(crate) global_secrets: Arc<dyn CredentialStore>,
    artifact_sourcer: Arc<dyn ArtifactSourcer>,
}

impl BuildStepDelegate {
    pub fn new(
        build: Arc<dyn Build>,
        plan_id: PlanId,
        state: Arc<dyn RunState>,
        clock: Arc<dyn Clock>,
        policy_checker: Arc<dyn PolicyChecker>,
        global_secrets: Arc<dyn CredentialStore>,
        artifact_sourcer: Arc<dyn ArtifactSourcer>,
    ) -> Self {
        BuildStepDelegate {
            build,
            plan_id,
            state,
            clock,
            stdout: None,
            stderr: None,
            policy_checker,
            global_secrets,
            artifact_sourcer,
        }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    /// Span for a step component, tagged with the build's attributes and
    /// `extra_attrs` (which win on key collisions).
    pub fn start_span(&self, component: &str, extra_attrs: TracingAttrs) -> tracing::Span {
        let mut attrs = self.build.tracing_attrs();
        attrs.extend(extra_attrs);

        tracing::info_span!(
            "step_component",
            component = %component,
            plan_id = %self.plan_id,
            attrs = ?attrs,
        )
    }

    // ------------------------------------------------------------------
    // Output streams
    // ------------------------------------------------------------------

    pub fn stdout(&mut self) -> &mut EventWriter {
        let writer = match self.stdout.take() {
            Some(writer) => writer,
            None => self.new_writer(Origin::stdout(self.plan_id.clone())),
        };
        self.stdout.insert(writer)
    }

    pub fn stderr(&mut self) -> &mut EventWriter {
        let writer = match self.stderr.take() {
            Some(writer) => writer,
            None => self.new_writer(Origin::stderr(self.plan_id.clone())),
        };
        self.stderr.insert(writer)
    }

    fn new_writer(&self, origin: Origin) -> EventWriter {
        if self.state.redaction_enabled() {
            EventWriter::with_redaction(
                Arc::clone(&self.build),
                origin,
                Arc::clone(&self.clock),
                self.output_filter(),
            )
        } else {
            EventWriter::new(Arc::clone(&self.build), origin, Arc::clone(&self.clock))
        }
    }

    fn output_filter(&self) -> OutputFilter {
        let state = Arc::clone(&self.state);
        Arc::new(move |text: &str| redact(state.as_ref(), text))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------
    //
    // Save failures here are logged and dropped: a step never fails because
    // its log could not be written.

    pub async fn initializing(&self) {
        let event = BuildEvent::Initialize(InitializeEvent {
            origin: self.origin(),
            time: Utc::now().timestamp(),
        });
        if self.save_lifecycle_event(event, "initialize").await {
            obs::emit_initializing(self.plan_id.as_str());
        }
    }

    pub async fn starting(&self) {
        let event = BuildEvent::Start(StartEvent {
            origin: self.origin(),
            time: Utc::now().timestamp(),
        });
        if self.save_lifecycle_event(event, "start").await {
            obs::emit_starting(self.plan_id.as_str());
        }
    }

    /// Close both streams, then record the outcome. Nothing for this step
    /// may be written afterwards.
    pub async fn finished(&mut self, succeeded: bool) {
        let plan_id = self.plan_id.clone();
        if let Err(err) = self.stdout().shutdown().await {
            obs::emit_stream_close_failed(plan_id.as_str(), "stdout", &err);
        }
        if let Err(err) = self.stderr().shutdown().await {
            obs::emit_stream_close_failed(plan_id.as_str(), "stderr", &err);
        }

        let event = BuildEvent::Finish(FinishEvent {
            origin: self.origin(),
            time: Utc::now().timestamp(),
            succeeded,
        });
        if self.save_lifecycle_event(event, "finish").await {
            obs::emit_finished(plan_id.as_str(), succeeded);
        }
    }

    pub async fn selected_worker(&self, worker_name: &str) {
        let event = BuildEvent::SelectedWorker(SelectedWorkerEvent {
            origin: self.origin(),
            time: Utc::now().timestamp(),
            selected_worker: worker_name.to_string(),
        });
        self.save_lifecycle_event(event, "selected-worker").await;
    }

    /// Uses the injected clock so error timestamps are controllable.
    pub async fn errored(&self, message: &str) {
        let event = BuildEvent::Error(ErrorEvent {
            origin: self.origin(),
            time: self.clock.now().timestamp(),
            message: message.to_string(),
        });
        self.save_lifecycle_event(event, "error").await;
    }

    fn origin(&self) -> Origin {
        Origin::step(self.plan_id.clone())
    }

    async fn save_lifecycle_event(&self, event: BuildEvent, phase: &str) -> bool {
        match self.build.save_event(event).await {
            Ok(()) => true,
            Err(err) => {
                obs::emit_event_save_failed(self.plan_id.as_str(), phase, &err);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Variables as seen by this step. `var_source_configs` replaces the
    /// scope's list inside every nested get-var scope, so callers can hide a
    /// source while its own configuration is being evaluated.
    pub fn variables(
        &self,
        ctx: &StepContext,
        var_source_configs: VarSourceConfigs,
    ) -> StepVariables<'_> {
        StepVariables::new(self, ctx.clone(), var_source_configs)
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    /// Fetch an image for this step: policy check, optional check plan, get
    /// plan, provenance, then wiring. Single attempt; callers own retries.
    pub async fn fetch_image(
        &self,
        ctx: &StepContext,
        get_plan: &Plan,
        check_plan: Option<&Plan>,
        privileged: bool,
    ) -> DelegateResult<(ImageSpec, UsedResourceCache)> {
        let attrs = TracingAttrs::from([
            ("image_plan".to_string(), get_plan.id.to_string()),
            ("privileged".to_string(), privileged.to_string()),
        ]);
        let span = self.start_span("image", attrs);

        self.fetch_image_in_scope(ctx, get_plan, check_plan, privileged)
            .instrument(span)
            .await
    }

    async fn fetch_image_in_scope(
        &self,
        ctx: &StepContext,
        get_plan: &Plan,
        check_plan: Option<&Plan>,
        privileged: bool,
    ) -> DelegateResult<(ImageSpec, UsedResourceCache)> {
        let get = get_plan.get_plan().ok_or_else(|| DelegateError::InvalidPlan {
            plan_id: get_plan.id.clone(),
            expected: "get".to_string(),
        })?;

        self.check_image_policy(&get.source, &get.resource_type, privileged)
            .await?;

        let fetch_state = self.state.new_scope();

        if let Some(check_plan) = check_plan {
            if !run_cancellable(ctx, fetch_state.as_ref(), check_plan).await? {
                return Err(DelegateError::ImageCheckFailed);
            }
        }

        if !run_cancellable(ctx, fetch_state.as_ref(), get_plan).await? {
            return Err(DelegateError::ImageFetchFailed);
        }

        let result: GetResult = fetch_state
            .result(&get_plan.id)
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or(DelegateError::GetNoResult)?;

        self.build
            .save_image_resource_version(&result.resource_cache)
            .await
            .map_err(DelegateError::SaveImageVersion)?;

        let artifact = fetch_state
            .artifact_repository()
            .artifact_for(&ArtifactName(result.name.clone()))
            .ok_or_else(|| DelegateError::FetchedArtifactNotFound {
                name: result.name.clone(),
            })?;

        let source = self
            .artifact_sourcer
            .source_image(ctx, &artifact)
            .await
            .map_err(DelegateError::WireImage)?;

        obs::emit_image_fetched(
            self.plan_id.as_str(),
            result.resource_cache.id,
            privileged,
        );

        Ok((
            ImageSpec {
                image_artifact_source: source,
                privileged,
            },
            result.resource_cache,
        ))
    }

    async fn check_image_policy(
        &self,
        image_source: &Source,
        image_type: &str,
        privileged: bool,
    ) -> DelegateResult<()> {
        if !self.policy_checker.should_check_action(ACTION_USE_IMAGE) {
            return Ok(());
        }

        let redacted_source = self
            .redact_image_source(image_source)
            .map_err(DelegateError::RedactSource)?;

        let mut data = serde_json::Map::new();
        data.insert("image_type".to_string(), json!(image_type));
        data.insert("image_source".to_string(), Value::Object(redacted_source));
        data.insert("privileged".to_string(), json!(privileged));

        let result = self
            .policy_checker
            .check(PolicyCheckInput {
                action: ACTION_USE_IMAGE.to_string(),
                team: self.build.team_name().to_string(),
                pipeline: self.build.pipeline_name().to_string(),
                data,
            })
            .await
            .map_err(DelegateError::PolicyCheck)?;

        if !result.allowed {
            obs::emit_policy_denied(self.plan_id.as_str(), ACTION_USE_IMAGE, &result.reasons);
            return Err(DelegateError::PolicyCheckNotPass {
                reasons: result.reasons,
            });
        }

        Ok(())
    }

    fn redact_image_source(&self, source: &Source) -> Result<Source, serde_json::Error> {
        let encoded = serde_json::to_string(source)?;
        let redacted = redact(self.state.as_ref(), &encoded);
        serde_json::from_str(&redacted)
    }
}

/// Run `plan` in `scope`, giving up as soon as `ctx` is cancelled.
pub(crate) async fn run_cancellable(
    ctx: &StepContext,
    scope: &dyn RunState,
    plan: &Plan,
) -> Result<bool, ExecError> {
    if ctx.is_cancelled() {
        return Err(ExecError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(ExecError::Cancelled),
        outcome = scope.run(ctx, plan) => outcome,
    }
}

impl std::fmt::Debug for BuildStepDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildStepDelegate")
            .field("build", &self.build.id())
            .field("plan_id", &self.plan_id)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .finish()
    }
}
