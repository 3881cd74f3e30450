//! Outreach sequence model: a directed graph of typed steps.
//!
//! The editor stores nodes with free-form `type` strings; [`SequenceDefinition::from_editor_json`]
//! maps them onto the closed [`Node`] enum so the engine can match exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CampaignError, CampaignResult};
use crate::types::ActionType;

/// A reusable outreach flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub id: Uuid,
    pub name: String,
    /// Content version, bumped on every accepted edit.
    pub version: u32,
    pub nodes: Vec<SequenceNode>,
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceNode {
    pub id: String,
    #[serde(flatten)]
    pub node: Node,
}

/// The step a node performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Start,
    End,
    SendInvite {
        #[serde(default)]
        message: String,
    },
    SendMessage {
        variants: Vec<MessageVariant>,
    },
    Delay(Delay),
    Condition {
        kind: ConditionKind,
    },
    ViewProfile,
    EndorseSkills,
    Follow,
    LikePost,
    FindEmail,
    SendEmail {
        subject: String,
        body: String,
    },
}

impl Node {
    /// The channel action this node produces, `None` for control-flow nodes.
    pub fn action_type(&self) -> Option<ActionType> {
        match self {
            Node::Start | Node::End | Node::Delay(_) | Node::Condition { .. } => None,
            Node::SendInvite { .. } => Some(ActionType::SendInvite),
            Node::SendMessage { .. } => Some(ActionType::SendMessage),
            Node::ViewProfile => Some(ActionType::ViewProfile),
            Node::EndorseSkills => Some(ActionType::EndorseSkills),
            Node::Follow => Some(ActionType::Follow),
            Node::LikePost => Some(ActionType::LikePost),
            Node::FindEmail => Some(ActionType::FindEmail),
            Node::SendEmail { .. } => Some(ActionType::SendEmail),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Node::Start => "start",
            Node::End => "end",
            Node::SendInvite { .. } => "send_invite",
            Node::SendMessage { .. } => "send_message",
            Node::Delay(_) => "delay",
            Node::Condition { .. } => "condition",
            Node::ViewProfile => "view_profile",
            Node::EndorseSkills => "endorse_skills",
            Node::Follow => "follow",
            Node::LikePost => "like_post",
            Node::FindEmail => "find_email",
            Node::SendEmail { .. } => "send_email",
        }
    }
}

/// One body of a `send_message` node, picked in proportion to `weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageVariant {
    pub body: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub value: u32,
    pub unit: DelayUnit,
}

impl Delay {
    pub const MIN_VALUE: u32 = 1;
    pub const MAX_VALUE: u32 = 30;

    pub fn days(value: u32) -> Self {
        Self {
            value,
            unit: DelayUnit::Days,
        }
    }

    pub fn hours(value: u32) -> Self {
        Self {
            value,
            unit: DelayUnit::Hours,
        }
    }

    pub fn in_range(&self) -> bool {
        (Self::MIN_VALUE..=Self::MAX_VALUE).contains(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Hours,
    Days,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    InviteAccepted,
    MessageRead,
    ProfileOpen,
}

impl ConditionKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "invite_accepted" => Some(Self::InviteAccepted),
            "message_read" => Some(Self::MessageRead),
            "profile_open" => Some(Self::ProfileOpen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Yes,
    No,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            branch: None,
        }
    }

    pub fn branch(source: impl Into<String>, target: impl Into<String>, branch: Branch) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            branch: Some(branch),
        }
    }
}

const KNOWN_NODE_TYPES: &[&str] = &[
    "start",
    "end",
    "send_invite",
    "send_message",
    "delay",
    "condition",
    "view_profile",
    "endorse_skills",
    "follow",
    "like_post",
    "find_email",
    "send_email",
];

impl SequenceDefinition {
    pub fn new(name: impl Into<String>, nodes: Vec<SequenceNode>, edges: Vec<Edge>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            nodes,
            edges,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, id: &str) -> Option<&SequenceNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Parse the flow editor's document format:
    ///
    /// ```json
    /// { "name": "...",
    ///   "nodes": [{ "id": "n1", "type": "delay", "data": { "value": 2, "unit": "days" } }],
    ///   "edges": [{ "source": "n1", "target": "n2", "sourceHandle": "yes" }] }
    /// ```
    ///
    /// Unknown node types and condition kinds are configuration errors.
    pub fn from_editor_json(doc: &serde_json::Value) -> CampaignResult<Self> {
        let name = doc
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("Untitled sequence");

        let raw_nodes = doc
            .get("nodes")
            .and_then(|v| v.as_array())
            .ok_or_else(|| CampaignError::Configuration("document has no `nodes` array".into()))?;

        let mut nodes = Vec::with_capacity(raw_nodes.len());
        for raw in raw_nodes {
            nodes.push(parse_editor_node(raw)?);
        }

        let mut edges = Vec::new();
        if let Some(raw_edges) = doc.get("edges").and_then(|v| v.as_array()) {
            for raw in raw_edges {
                edges.push(parse_editor_edge(raw)?);
            }
        }

        let mut definition = Self::new(name, nodes, edges);
        if let Some(id) = doc
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            definition.id = id;
        }
        Ok(definition)
    }
}

fn parse_editor_node(raw: &serde_json::Value) -> CampaignResult<SequenceNode> {
    let id = raw
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CampaignError::Configuration("node without an `id`".into()))?;
    let node_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CampaignError::Configuration(format!("node `{id}` has no `type`")))?;

    if !KNOWN_NODE_TYPES.contains(&node_type) {
        return Err(CampaignError::Configuration(format!(
            "unknown node type `{node_type}` on node `{id}`"
        )));
    }

    let mut body = match raw.get("data") {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };

    if node_type == "condition" {
        let kind = body.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        if ConditionKind::parse(kind).is_none() {
            return Err(CampaignError::Configuration(format!(
                "unknown condition kind `{kind}` on node `{id}`"
            )));
        }
    }

    body.insert("type".into(), serde_json::Value::String(node_type.to_string()));
    let node: Node = serde_json::from_value(serde_json::Value::Object(body)).map_err(|e| {
        CampaignError::Configuration(format!("invalid data on {node_type} node `{id}`: {e}"))
    })?;

    Ok(SequenceNode {
        id: id.to_string(),
        node,
    })
}

fn parse_editor_edge(raw: &serde_json::Value) -> CampaignResult<Edge> {
    let field = |name: &str| {
        raw.get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| CampaignError::Configuration(format!("edge without `{name}`")))
    };
    let source = field("source")?;
    let target = field("target")?;

    let branch = match raw
        .get("sourceHandle")
        .or_else(|| raw.get("branch"))
        .and_then(|v| v.as_str())
    {
        None => None,
        Some("yes") => Some(Branch::Yes),
        Some("no") => Some(Branch::No),
        Some(other) => {
            return Err(CampaignError::Configuration(format!(
                "unknown branch label `{other}` on edge {source} -> {target}"
            )))
        }
    };

    Ok(Edge {
        source,
        target,
        branch,
    })
}
