//! Variable resolution for a step.
//!
//! Lookup order for a reference:
//! 1. no source: the team/pipeline credential store, as-is
//! 2. variables already produced in the step's scope
//! 3. the named var source, fetched by running a get-var sub-plan in a
//!    child scope
//!
//! Resolution is lazy and per reference: var sources may be remote secret
//! backends and a step rarely needs all of them.

use async_trait::async_trait;
use build_ledger::{BuildEvent, Origin, PlanId, SubGetVarEvent, TracingAttrs};
use serde_json::Value;
use tracing::Instrument;

use crate::context::StepContext;
use crate::delegate::{run_cancellable, BuildStepDelegate};
use crate::error::{DelegateError, DelegateResult, ExecError};
use crate::obs;
use crate::plan::{GetVarPlan, Plan, PlanStep};
use crate::vars::{CredentialVariables, VarReference, VarSourceConfigs, Variables};

/// Variables bound to one delegate, cancellation context and var source list.
pub struct StepVariables<'a> {
    delegate: &'a BuildStepDelegate,
    ctx: StepContext,
    var_source_configs: VarSourceConfigs,
}

impl<'a> StepVariables<'a> {
    pub(crate) fn new(
        delegate: &'a BuildStepDelegate,
        ctx: StepContext,
        var_source_configs: VarSourceConfigs,
    ) -> Self {
        StepVariables {
            delegate,
            ctx,
            var_source_configs,
        }
    }

    /// Plan id of the get-var sub-plan for `reference` under this step.
    pub fn get_var_plan_id(&self, reference: &VarReference) -> PlanId {
        PlanId::new(format!(
            "{}/get-var/{}:{}",
            self.delegate.plan_id, reference.source, reference.path
        ))
    }

    async fn fetch_from_var_source(&self, reference: &VarReference) -> DelegateResult<Value> {
        let delegate = self.delegate;

        let lineage = delegate.state.var_source_lineage();
        if lineage.iter().any(|name| name == &reference.source) {
            let mut chain = lineage;
            chain.push(reference.source.clone());
            return Err(DelegateError::VarSourceCycle {
                source_name: reference.source.clone(),
                chain,
            });
        }

        let mut child = delegate.state.new_scope();
        child.set_var_source_configs(self.var_source_configs.clone());
        child.enter_var_source(&reference.source);

        let var_source = child
            .var_source_configs()
            .lookup(&reference.source)
            .cloned()
            .ok_or_else(|| DelegateError::NoMatchingVarSource {
                source_name: reference.source.clone(),
            })?;

        let source = match var_source.config {
            Value::Object(source) => source,
            other => {
                return Err(DelegateError::VarSourceUnparseable {
                    source_name: reference.source.clone(),
                    config: other,
                })
            }
        };

        let get_var_id = self.get_var_plan_id(reference);
        let plan = Plan::new(
            get_var_id.clone(),
            PlanStep::GetVar(GetVarPlan {
                name: reference.source.clone(),
                path: reference.path.clone(),
                source_type: var_source.source_type,
                fields: reference.fields.clone(),
                source,
            }),
        );

        delegate
            .build
            .save_event(BuildEvent::SubGetVar(SubGetVarEvent {
                origin: Origin::step(delegate.plan_id.clone()),
                time: delegate.clock.now().timestamp(),
                public_plan: plan.public(),
            }))
            .await
            .map_err(DelegateError::SaveSubGetVarEvent)?;

        obs::emit_sub_get_var(
            delegate.plan_id.as_str(),
            get_var_id.as_str(),
            &reference.source,
        );

        let ok = match run_cancellable(&self.ctx, child.as_ref(), &plan).await {
            Ok(ok) => ok,
            Err(ExecError::Cancelled) => return Err(DelegateError::Cancelled),
            Err(err) => return Err(DelegateError::RunSubGetVar(err)),
        };

        if !ok {
            return Err(DelegateError::GetVarFailed);
        }

        child
            .result(&get_var_id)
            .ok_or(DelegateError::GetVarNoValue)
    }
}

#[async_trait]
impl Variables for StepVariables<'_> {
    async fn get(&self, reference: &VarReference) -> DelegateResult<Option<Value>> {
        let delegate = self.delegate;

        if reference.is_global() {
            let globals = CredentialVariables::new(
                delegate.global_secrets.clone(),
                delegate.build.team_name(),
                delegate.build.pipeline_name(),
            );
            return globals.get(reference).await;
        }

        if let Some(value) = delegate
            .state
            .local_variable(reference)
            .map_err(DelegateError::LocalVariables)?
        {
            return Ok(Some(value));
        }

        let attrs = TracingAttrs::from([
            ("var_source".to_string(), reference.source.clone()),
            ("var_path".to_string(), reference.path.clone()),
        ]);
        let span = delegate.start_span("get_var", attrs);

        self.fetch_from_var_source(reference)
            .instrument(span)
            .await
            .map(Some)
    }
}
