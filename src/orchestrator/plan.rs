//! Plans and the planning seam.
//!
//! The coordinator treats planning and synthesis as opaque calls behind
//! [`Planner`]; an LLM-backed brain and the built-in keyword rules are
//! interchangeable. The plan shape is internal to this node and is not
//! a wire contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError, WorkerErrorKind};
use crate::types::{Message, Part};

/// One delegable unit of a decomposed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Unique id within the plan.
    pub step_id: String,
    /// Human-readable description of what the step should achieve.
    pub description: String,
    /// Step ids that must complete before this step may dispatch.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// The skill tag a peer must advertise to receive this step.
    pub target_skill: String,
    /// The text forwarded to the selected peer.
    pub input: String,
    /// Required steps fail the whole task when they fail; optional
    /// steps are noted as omissions in the synthesis.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// An ordered list of steps; aggregation reads outputs in this order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    /// The plan's steps, in aggregation order.
    pub steps: Vec<Step>,
}

impl Plan {
    /// Looks up a step by id.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Verifies every dependency references a declared step.
    pub fn validate(&self) -> Result<()> {
        for step in &self.steps {
            for dep in &step.depends_on {
                if self.step(dep).is_none() {
                    return Err(WorkerError::new(
                        WorkerErrorKind::PlanningFailed,
                        format!("step '{}' depends on unknown step '{dep}'", step.step_id),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// What a finished step contributed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutput {
    /// The step this output belongs to.
    pub step_id: String,
    /// The peer's answer parts, when the step succeeded.
    pub parts: Vec<Part>,
    /// Set when an optional step was skipped; names the reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omitted: Option<String>,
}

/// A routable peer's advertised skills, as the planner sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSkills {
    /// The peer's configured name.
    pub name: String,
    /// Skill tags the peer advertises.
    pub tags: Vec<String>,
}

/// The opaque reasoning seam of the coordinator.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Decomposes the user request into a plan over the known peers.
    async fn plan(&self, request: &Message, peers: &[PeerSkills]) -> Result<Plan>;

    /// Composes the final answer from step outputs, given in plan order.
    async fn synthesize(&self, request: &Message, outputs: &[StepOutput]) -> Result<Vec<Part>>;
}

/// Rule-driven planner routing on skill-tag keywords.
///
/// One step per skill tag whose keyword appears in the request text;
/// when nothing matches, a single step targets the fallback skill. This
/// keeps an orchestrating node runnable without an LLM brain and is the
/// deterministic baseline the tests exercise.
#[derive(Debug, Default)]
pub struct KeywordPlanner {
    fallback_skill: Option<String>,
}

impl KeywordPlanner {
    /// Creates a planner with no fallback: an unmatched request fails
    /// planning.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the skill receiving unmatched requests.
    #[must_use]
    pub fn with_fallback(mut self, skill: impl Into<String>) -> Self {
        self.fallback_skill = Some(skill.into());
        self
    }
}

#[async_trait]
impl Planner for KeywordPlanner {
    async fn plan(&self, request: &Message, peers: &[PeerSkills]) -> Result<Plan> {
        let text = request.text_content().unwrap_or_default().to_lowercase();

        let mut tags: Vec<&str> = peers
            .iter()
            .flat_map(|p| p.tags.iter().map(String::as_str))
            .collect();
        tags.sort_unstable();
        tags.dedup();

        let mut steps = Vec::new();
        for tag in tags {
            if text.contains(&tag.to_lowercase()) {
                steps.push(Step {
                    step_id: format!("step-{}", steps.len() + 1),
                    description: format!("answer the {tag} portion of the request"),
                    depends_on: Vec::new(),
                    target_skill: tag.to_string(),
                    input: request.text_content().unwrap_or_default(),
                    required: true,
                });
            }
        }

        if steps.is_empty() {
            let Some(ref fallback) = self.fallback_skill else {
                return Err(WorkerError::new(
                    WorkerErrorKind::PlanningFailed,
                    "request matched no known skill",
                )
                .into());
            };
            steps.push(Step {
                step_id: "step-1".to_string(),
                description: "answer the request".to_string(),
                depends_on: Vec::new(),
                target_skill: fallback.clone(),
                input: request.text_content().unwrap_or_default(),
                required: true,
            });
        }

        Ok(Plan { steps })
    }

    async fn synthesize(&self, _request: &Message, outputs: &[StepOutput]) -> Result<Vec<Part>> {
        let mut sections = Vec::new();
        for output in outputs {
            if let Some(ref reason) = output.omitted {
                sections.push(format!("({}: unavailable, {reason})", output.step_id));
                continue;
            }
            let text = output
                .parts
                .iter()
                .filter_map(Part::as_text)
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                sections.push(text);
            }
        }
        Ok(vec![Part::text(sections.join("\n"))])
    }
}
