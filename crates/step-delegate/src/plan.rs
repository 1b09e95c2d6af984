//! Sub-plans the delegate synthesizes or runs on a step's behalf.

use build_ledger::PlanId;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Resource or var source configuration. Frequently holds credentials.
pub type Source = serde_json::Map<String, serde_json::Value>;

/// A node in a build's plan tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    #[serde(flatten)]
    pub step: PlanStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStep {
    Get(GetPlan),
    Check(CheckPlan),
    GetVar(GetVarPlan),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<build_ledger::Version>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPlan {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source: Source,
}

/// Fetch one variable from a named var source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetVarPlan {
    /// Var source name
    pub name: String,
    pub path: String,
    /// Var source type (e.g. "vault")
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    pub source: Source,
}

impl Plan {
    pub fn new(id: impl Into<PlanId>, step: PlanStep) -> Self {
        Plan {
            id: id.into(),
            step,
        }
    }

    pub fn get_plan(&self) -> Option<&GetPlan> {
        match &self.step {
            PlanStep::Get(get) => Some(get),
            _ => None,
        }
    }

    /// View of the plan that is safe to show to anyone who can see the build:
    /// step kind and identifying fields, never `source` or `params`.
    pub fn public(&self) -> serde_json::Value {
        let step = match &self.step {
            PlanStep::Get(get) => json!({
                "get": {
                    "name": get.name,
                    "type": get.resource_type,
                    "version": get.version,
                }
            }),
            PlanStep::Check(check) => json!({
                "check": {
                    "name": check.name,
                    "type": check.resource_type,
                }
            }),
            PlanStep::GetVar(get_var) => json!({
                "get_var": {
                    "name": get_var.name,
                    "type": get_var.source_type,
                    "path": get_var.path,
                    "fields": get_var.fields,
                }
            }),
        };

        let mut public = json!({ "id": self.id });
        if let (Some(public), Some(step)) = (public.as_object_mut(), step.as_object()) {
            public.extend(step.clone());
        }
        public
    }
}
