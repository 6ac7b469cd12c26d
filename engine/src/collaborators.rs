// engine/src/collaborators.rs
//!
//! Interfaces the engine consumes from the rest of the platform: caller
//! identity, the node store and the user store. Nodes are opaque apart from
//! the fields below. The in-memory stores back tests and embedded use.

use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Anon,
    User,
    Operator,
    Provider,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anon => "anon",
            Role::User => "user",
            Role::Operator => "operator",
            Role::Provider => "provider",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "anon" => Ok(Role::Anon),
            "user" => Ok(Role::User),
            "operator" => Ok(Role::Operator),
            "provider" => Ok(Role::Provider),
            other => Err(Error::InvalidInput(format!("unknown role '{other}'"))),
        }
    }
}

/// Authentication claims attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub handle: String,
    pub role: Role,
}

impl Claims {
    pub fn new(user_id: impl Into<String>, handle: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            handle: handle.into(),
            role,
        }
    }

    pub fn is_operator(&self) -> bool {
        self.role == Role::Operator
    }
}

/// Resolves optional claims into authenticated, non-anonymous claims.
pub fn require_auth(claims: Option<&Claims>) -> Result<&Claims> {
    match claims {
        Some(c) if c.role != Role::Anon => Ok(c),
        _ => Err(Error::Unauthorized("authentication required".into())),
    }
}

pub fn require_operator(claims: Option<&Claims>) -> Result<&Claims> {
    let claims = require_auth(claims)?;
    if !claims.is_operator() {
        return Err(Error::Forbidden("operator role required".into()));
    }
    Ok(claims)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub body: String,
    pub author_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Existing evaluation score, used by benchmark corpus filters.
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub handle: String,
    pub role: Role,
    pub credits: i64,
}

pub trait NodeStore: Send + Sync {
    fn get_node(&self, id: &str) -> Result<Option<Node>>;

    /// Candidate nodes for dedup, optionally restricted to one node type.
    fn nodes_by_type(&self, node_type: Option<&str>) -> Result<Vec<Node>>;

    /// Corpus selection for benchmarks: nodes carrying every tag in `tags`
    /// with a score of at least `min_score` when one is given.
    fn find_nodes(&self, tags: &[String], min_score: Option<f64>) -> Result<Vec<Node>>;

    fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<Node>>;
}

pub trait UserStore: Send + Sync {
    fn get_user_by_id(&self, id: &str) -> Result<Option<User>>;
    fn get_user_by_handle(&self, handle: &str) -> Result<Option<User>>;
    fn debit_credits(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<i64>;
}

#[derive(Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<Vec<Node>>,
}

impl InMemoryNodeStore {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    pub fn insert(&self, node: Node) {
        let mut nodes = self.nodes.write();
        nodes.retain(|n| n.id != node.id);
        nodes.push(node);
    }
}

impl NodeStore for InMemoryNodeStore {
    fn get_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.nodes.read().iter().find(|n| n.id == id).cloned())
    }

    fn nodes_by_type(&self, node_type: Option<&str>) -> Result<Vec<Node>> {
        Ok(self
            .nodes
            .read()
            .iter()
            .filter(|n| node_type.map(|t| n.node_type == t).unwrap_or(true))
            .cloned()
            .collect())
    }

    fn find_nodes(&self, tags: &[String], min_score: Option<f64>) -> Result<Vec<Node>> {
        Ok(self
            .nodes
            .read()
            .iter()
            .filter(|n| tags.iter().all(|t| n.tags.contains(t)))
            .filter(|n| match min_score {
                Some(min) => n.score.map(|s| s >= min).unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect())
    }

    fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<Node>> {
        let needle = query.to_lowercase();
        Ok(self
            .nodes
            .read()
            .iter()
            .filter(|n| n.body.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserStore {
    pub fn new(users: Vec<User>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().map(|u| (u.id.clone(), u)).collect()),
        }
    }
}

impl UserStore for InMemoryUserStore {
    fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.read().get(id).cloned())
    }

    fn get_user_by_handle(&self, handle: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.handle == handle)
            .cloned())
    }

    fn debit_credits(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<i64> {
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
        if user.credits < amount {
            return Err(Error::Forbidden(format!(
                "insufficient credits for {reason} on {entity_type} {entity_id}"
            )));
        }
        user.credits -= amount;
        Ok(user.credits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, tags: &[&str], score: Option<f64>) -> Node {
        Node {
            id: id.into(),
            node_type: "claim".into(),
            body: format!("body of {id}"),
            author_id: "u1".into(),
            metadata: serde_json::Value::Null,
            created_at: crate::now_timestamp(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            score,
        }
    }

    #[test]
    fn find_nodes_requires_all_tags_and_min_score() {
        let store = InMemoryNodeStore::new(vec![
            node("a", &["physics", "climate"], Some(0.9)),
            node("b", &["physics"], Some(0.9)),
            node("c", &["physics", "climate"], Some(0.2)),
            node("d", &["physics", "climate"], None),
        ]);
        let tags = vec!["physics".to_string(), "climate".to_string()];
        let found = store.find_nodes(&tags, Some(0.5)).unwrap();
        let ids: Vec<_> = found.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["a"]);
        assert_eq!(store.find_nodes(&tags, None).unwrap().len(), 3);
    }

    #[test]
    fn anonymous_claims_are_unauthorized() {
        let anon = Claims::new("x", "x", Role::Anon);
        assert!(require_auth(Some(&anon)).is_err());
        assert!(require_auth(None).is_err());
        let user = Claims::new("u", "u", Role::User);
        assert_eq!(
            require_operator(Some(&user)).unwrap_err().kind(),
            crate::ErrorKind::Forbidden
        );
    }

    #[test]
    fn debit_refuses_overdraft() {
        let users = InMemoryUserStore::new(vec![User {
            id: "u1".into(),
            handle: "ada".into(),
            role: Role::User,
            credits: 5,
        }]);
        assert_eq!(users.debit_credits("u1", 3, "dispatch", "dispatch", "d1").unwrap(), 2);
        assert!(users.debit_credits("u1", 3, "dispatch", "dispatch", "d2").is_err());
        assert_eq!(users.get_user_by_handle("ada").unwrap().unwrap().credits, 2);
    }
}
