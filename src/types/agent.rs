//! Agent card and capability types.
//!
//! The agent card is the self-describing manifest a node serves at
//! `/.well-known/agent.json`: identity, skills, capabilities, and the
//! authentication schemes callers must use.

use serde::{Deserialize, Serialize};

/// The public descriptor of an agent node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    /// A human-readable name for the agent.
    pub name: String,
    /// The agent's own version number.
    pub version: String,
    /// A human-readable description of the agent.
    pub description: String,
    /// The endpoint URL for interacting with the agent.
    pub url: String,
    /// The set of skills the agent can perform.
    pub skills: Vec<AgentSkill>,
    /// A declaration of optional capabilities supported by the agent.
    pub capabilities: AgentCapabilities,
    /// Authentication schemes accepted on non-public endpoints.
    #[serde(default)]
    pub authentication_schemes: Vec<AuthScheme>,
}

impl AgentCard {
    /// Creates a new card builder.
    pub fn builder(name: impl Into<String>, url: impl Into<String>) -> AgentCardBuilder {
        AgentCardBuilder::new(name, url)
    }

    /// Returns true if the agent supports SSE streaming.
    #[must_use]
    pub const fn supports_streaming(&self) -> bool {
        self.capabilities.streaming
    }

    /// Returns true if the agent advertises a skill with the given tag.
    #[must_use]
    pub fn has_skill_tag(&self, tag: &str) -> bool {
        self.skills.iter().any(|s| s.tags.iter().any(|t| t == tag))
    }

    /// Finds a skill by its ID.
    #[must_use]
    pub fn find_skill(&self, skill_id: &str) -> Option<&AgentSkill> {
        self.skills.iter().find(|s| s.id == skill_id)
    }
}

/// Builder for creating an [`AgentCard`].
#[derive(Debug)]
pub struct AgentCardBuilder {
    card: AgentCard,
}

impl AgentCardBuilder {
    /// Creates a new builder with required fields.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            card: AgentCard {
                name: name.into(),
                version: "0.1.0".to_string(),
                description: String::new(),
                url: url.into(),
                skills: Vec::new(),
                capabilities: AgentCapabilities::default(),
                authentication_schemes: Vec::new(),
            },
        }
    }

    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.card.description = description.into();
        self
    }

    /// Sets the version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.card.version = version.into();
        self
    }

    /// Sets the capabilities.
    #[must_use]
    pub fn capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.card.capabilities = capabilities;
        self
    }

    /// Adds a skill.
    #[must_use]
    pub fn skill(mut self, skill: AgentSkill) -> Self {
        self.card.skills.push(skill);
        self
    }

    /// Adds an accepted authentication scheme.
    #[must_use]
    pub fn auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.card.authentication_schemes.push(scheme);
        self
    }

    /// Builds the card.
    #[must_use]
    pub fn build(self) -> AgentCard {
        self.card
    }
}

/// Optional capabilities a node may support.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentCapabilities {
    /// SSE streaming via `message/stream` and `tasks/resubscribe`.
    pub streaming: bool,
    /// Webhook push notification configuration.
    pub push_notifications: bool,
    /// Full state transition history retained per task.
    pub state_transition_history: bool,
    /// When true, `message/send` blocks until the task is terminal.
    pub synchronous_completion: bool,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            push_notifications: false,
            state_transition_history: true,
            synchronous_completion: false,
        }
    }
}

/// A distinct function an agent can perform, discoverable by tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSkill {
    /// A unique identifier for the skill.
    pub id: String,
    /// A human-readable name for the skill.
    pub name: String,
    /// A detailed description of the skill.
    pub description: String,
    /// Keywords used by orchestrators to route steps to this skill.
    pub tags: Vec<String>,
    /// Example prompts this skill can handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub examples: Option<Vec<String>>,
}

impl AgentSkill {
    /// Creates a new skill with required fields.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            tags,
            examples: None,
        }
    }

    /// Sets the examples for this skill.
    #[must_use]
    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.examples = Some(examples);
        self
    }
}

/// An authentication scheme accepted by a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scheme", rename_all = "camelCase")]
pub enum AuthScheme {
    /// HTTP Bearer token in the `Authorization` header.
    Bearer,
    /// Static API key in a custom header.
    ApiKey {
        /// The header carrying the key.
        header: String,
    },
    /// OAuth2 client-credentials flow against a token endpoint.
    OAuth2 {
        /// Where callers obtain tokens.
        token_url: String,
    },
}
