//! Structural checks over a sequence graph.
//!
//! Runs on every edit-save and before every activation. The engine only ever
//! sees a [`ValidDefinition`], so it never re-checks structure at runtime.

use std::collections::{HashMap, HashSet, VecDeque};

use campaign_core::error::CampaignError;
use campaign_core::sequence::{Branch, Node, SequenceDefinition};
use thiserror::Error;
use uuid::Uuid;

/// LinkedIn caps connection notes at 300 characters.
pub const MAX_INVITE_NOTE_CHARS: usize = 300;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("sequence has no start node")]
    MissingStartNode,

    #[error("sequence has more than one start node")]
    MultipleStartNodes,

    #[error("node `{0}` is not reachable from start")]
    OrphanNode(String),

    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("condition node `{0}` needs exactly one `yes` and one `no` edge")]
    ConditionMissingBranch(String),

    #[error("node id `{0}` is used more than once")]
    DuplicateNode(String),

    #[error("edge {from} -> {to} references an unknown node")]
    DanglingEdge { from: String, to: String },

    #[error("node `{0}` has more than one outgoing edge")]
    MultipleSuccessors(String),

    #[error("end node `{0}` cannot have outgoing edges")]
    EndHasSuccessor(String),

    #[error("edge {from} -> {to} carries a branch label but its source is not a condition")]
    UnexpectedBranchLabel { from: String, to: String },

    #[error("delay on node `{node}` must be between 1 and 30, got {value}")]
    DelayOutOfRange { node: String, value: u32 },

    #[error("send_message node `{0}` needs at least one variant with a positive weight")]
    EmptyVariants(String),

    #[error("invite note on node `{node}` is {len} characters, limit is 300")]
    InviteNoteTooLong { node: String, len: usize },

    #[error("send_email node `{0}` needs a subject and a body")]
    EmptyEmail(String),
}

impl From<GraphError> for CampaignError {
    fn from(err: GraphError) -> Self {
        CampaignError::GraphValidation(err.to_string())
    }
}

/// Where a node leads.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Successor {
    Terminal,
    Next(String),
    Branch { yes: String, no: String },
}

/// A sequence that passed [`validate`], indexed for the engine.
#[derive(Debug, Clone)]
pub struct ValidDefinition {
    definition: SequenceDefinition,
    index: HashMap<String, usize>,
    successors: HashMap<String, Successor>,
    start: String,
}

impl ValidDefinition {
    pub fn id(&self) -> Uuid {
        self.definition.id
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }

    pub fn definition(&self) -> &SequenceDefinition {
        &self.definition
    }

    pub fn start_node_id(&self) -> &str {
        &self.start
    }

    pub fn len(&self) -> usize {
        self.definition.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.definition.nodes[i].node)
    }

    /// The sole successor of a non-condition node, `None` for leaves.
    pub fn next(&self, id: &str) -> Option<&str> {
        match self.successors.get(id)? {
            Successor::Next(target) => Some(target),
            Successor::Terminal | Successor::Branch { .. } => None,
        }
    }

    /// The `yes`/`no` target of a condition node.
    pub fn branch(&self, id: &str, branch: Branch) -> Option<&str> {
        match self.successors.get(id)? {
            Successor::Branch { yes, no } => Some(match branch {
                Branch::Yes => yes,
                Branch::No => no,
            }),
            _ => None,
        }
    }
}

/// Check every structural invariant of a sequence graph.
pub fn validate(definition: &SequenceDefinition) -> Result<ValidDefinition, GraphError> {
    let mut index = HashMap::new();
    for (i, node) in definition.nodes.iter().enumerate() {
        if index.insert(node.id.clone(), i).is_some() {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }
    }

    let starts: Vec<&str> = definition
        .nodes
        .iter()
        .filter(|n| matches!(n.node, Node::Start))
        .map(|n| n.id.as_str())
        .collect();
    let start = match starts.as_slice() {
        [] => return Err(GraphError::MissingStartNode),
        [only] => only.to_string(),
        _ => return Err(GraphError::MultipleStartNodes),
    };

    let mut outgoing: HashMap<&str, Vec<(&str, Option<Branch>)>> = HashMap::new();
    for edge in &definition.edges {
        if !index.contains_key(&edge.source) || !index.contains_key(&edge.target) {
            return Err(GraphError::DanglingEdge {
                from: edge.source.clone(),
                to: edge.target.clone(),
            });
        }
        outgoing
            .entry(edge.source.as_str())
            .or_default()
            .push((edge.target.as_str(), edge.branch));
    }

    let mut successors = HashMap::new();
    for node in &definition.nodes {
        check_node_data(&node.id, &node.node)?;
        let edges = outgoing.get(node.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
        let successor = match &node.node {
            Node::Condition { .. } => condition_successor(&node.id, edges)?,
            Node::End => {
                if !edges.is_empty() {
                    return Err(GraphError::EndHasSuccessor(node.id.clone()));
                }
                Successor::Terminal
            }
            _ => match edges {
                [] => Successor::Terminal,
                [(target, None)] => Successor::Next(target.to_string()),
                [(target, Some(_))] => {
                    return Err(GraphError::UnexpectedBranchLabel {
                        from: node.id.clone(),
                        to: target.to_string(),
                    })
                }
                _ => return Err(GraphError::MultipleSuccessors(node.id.clone())),
            },
        };
        successors.insert(node.id.clone(), successor);
    }

    let reachable = reachable_from(&start, &outgoing);
    if let Some(orphan) = definition.nodes.iter().find(|n| !reachable.contains(n.id.as_str())) {
        return Err(GraphError::OrphanNode(orphan.id.clone()));
    }

    if let Some(path) = find_cycle(&start, &outgoing) {
        return Err(GraphError::CycleDetected(path));
    }

    Ok(ValidDefinition {
        definition: definition.clone(),
        index,
        successors,
        start,
    })
}

fn check_node_data(id: &str, node: &Node) -> Result<(), GraphError> {
    match node {
        Node::Delay(delay) if !delay.in_range() => Err(GraphError::DelayOutOfRange {
            node: id.to_string(),
            value: delay.value,
        }),
        Node::SendMessage { variants }
            if variants.is_empty() || variants.iter().all(|v| v.weight == 0) =>
        {
            Err(GraphError::EmptyVariants(id.to_string()))
        }
        Node::SendInvite { message } if message.chars().count() > MAX_INVITE_NOTE_CHARS => {
            Err(GraphError::InviteNoteTooLong {
                node: id.to_string(),
                len: message.chars().count(),
            })
        }
        Node::SendEmail { subject, body } if subject.trim().is_empty() || body.trim().is_empty() => {
            Err(GraphError::EmptyEmail(id.to_string()))
        }
        _ => Ok(()),
    }
}

fn condition_successor(id: &str, edges: &[(&str, Option<Branch>)]) -> Result<Successor, GraphError> {
    let missing = || GraphError::ConditionMissingBranch(id.to_string());
    let pick = |wanted: Branch| {
        let mut hits = edges.iter().filter(|(_, b)| *b == Some(wanted));
        match (hits.next(), hits.next()) {
            (Some((target, _)), None) => Some(target.to_string()),
            _ => None,
        }
    };

    if edges.len() != 2 {
        return Err(missing());
    }
    let yes = pick(Branch::Yes).ok_or_else(missing)?;
    let no = pick(Branch::No).ok_or_else(missing)?;
    Ok(Successor::Branch { yes, no })
}

fn reachable_from<'a>(
    start: &'a str,
    outgoing: &HashMap<&'a str, Vec<(&'a str, Option<Branch>)>>,
) -> HashSet<&'a str> {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for (target, _) in outgoing.get(id).into_iter().flatten() {
            if seen.insert(*target) {
                queue.push_back(*target);
            }
        }
    }
    seen
}

/// Depth-first search keeping the current path; returns the first cycle found.
fn find_cycle(start: &str, outgoing: &HashMap<&str, Vec<(&str, Option<Branch>)>>) -> Option<Vec<String>> {
    fn visit<'a>(
        id: &'a str,
        outgoing: &HashMap<&'a str, Vec<(&'a str, Option<Branch>)>>,
        done: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        path.push(id);
        for (target, _) in outgoing.get(id).into_iter().flatten() {
            if let Some(pos) = path.iter().position(|p| p == target) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(target.to_string());
                return Some(cycle);
            }
            if !done.contains(target) {
                if let Some(cycle) = visit(*target, outgoing, done, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        done.insert(id);
        None
    }

    visit(start, outgoing, &mut HashSet::new(), &mut Vec::new())
}
