// engine/src/dedup.rs
//!
//! Duplicate detection over node bodies. The exact layer compares SHA-256
//! hashes of normalized text; the fuzzy layer compares character trigram
//! sets by Jaccard similarity. Clusters group duplicates administratively;
//! a node belongs to at most one cluster per method.

use crate::collaborators::{require_operator, Claims, NodeStore};
use crate::store;
use crate::{now_timestamp, sha256_hex, Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Exact,
    Fuzzy,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Exact => "exact",
            MatchMethod::Fuzzy => "fuzzy",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "exact" => Ok(MatchMethod::Exact),
            "fuzzy" => Ok(MatchMethod::Fuzzy),
            other => Err(Error::InvalidInput(format!("unknown dedup method '{other}'"))),
        }
    }
}

/// Which layers a check runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMethod {
    Exact,
    Fuzzy,
    #[default]
    All,
}

impl CheckMethod {
    fn exact(&self) -> bool {
        matches!(self, CheckMethod::Exact | CheckMethod::All)
    }

    fn fuzzy(&self) -> bool {
        matches!(self, CheckMethod::Fuzzy | CheckMethod::All)
    }
}

/// Lowercases, collapses Unicode whitespace runs to one space and trims.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn content_hash(text: &str) -> String {
    sha256_hex(normalize(text).as_bytes())
}

/// Character trigrams of the normalized text. Texts shorter than three
/// characters yield themselves as a single gram.
pub fn trigrams(text: &str) -> HashSet<String> {
    let chars: Vec<char> = normalize(text).chars().collect();
    if chars.len() < 3 {
        return if chars.is_empty() {
            HashSet::new()
        } else {
            HashSet::from([chars.iter().collect::<String>()])
        };
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub body: String,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub method: CheckMethod,
    #[serde(default)]
    pub node_type: Option<String>,
}

impl CheckRequest {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            threshold: None,
            method: CheckMethod::All,
            node_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupMatch {
    pub node_id: String,
    pub method: MatchMethod,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupReport {
    pub matches: Vec<DedupMatch>,
    /// Exact-method cluster of the first exact match that has one.
    pub cluster_id: Option<String>,
}

/// Scans candidate nodes for duplicates of `request.body`. Exact matches
/// come first; fuzzy matches follow by descending similarity.
pub fn check(conn: &Connection, nodes: &dyn NodeStore, request: &CheckRequest) -> Result<DedupReport> {
    let threshold = request.threshold.unwrap_or(DEFAULT_THRESHOLD);
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(Error::InvalidInput(format!("threshold {threshold} is outside (0, 1]")));
    }
    if normalize(&request.body).is_empty() {
        return Err(Error::InvalidInput("body is empty".into()));
    }

    let hash = content_hash(&request.body);
    let grams = request.method.fuzzy().then(|| trigrams(&request.body));
    let candidates = nodes.nodes_by_type(request.node_type.as_deref())?;

    let mut exact = Vec::new();
    let mut fuzzy = Vec::new();
    for node in &candidates {
        if request.method.exact() && content_hash(&node.body) == hash {
            exact.push(DedupMatch {
                node_id: node.id.clone(),
                method: MatchMethod::Exact,
                similarity: 1.0,
            });
            continue;
        }
        if let Some(grams) = &grams {
            let similarity = jaccard(grams, &trigrams(&node.body));
            if similarity >= threshold {
                fuzzy.push(DedupMatch {
                    node_id: node.id.clone(),
                    method: MatchMethod::Fuzzy,
                    similarity,
                });
            }
        }
    }
    fuzzy.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

    let mut cluster_id = None;
    for found in &exact {
        cluster_id = conn
            .query_row(
                "SELECT cluster_id FROM dedup_members WHERE node_id = ?1 AND method = 'exact'",
                params![found.node_id],
                |row| row.get(0),
            )
            .optional()?;
        if cluster_id.is_some() {
            break;
        }
    }
    debug!(
        candidates = candidates.len(),
        exact = exact.len(),
        fuzzy = fuzzy.len(),
        "dedup check"
    );

    exact.extend(fuzzy);
    Ok(DedupReport {
        matches: exact,
        cluster_id,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMember {
    pub node_id: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCluster {
    pub canonical_id: String,
    pub method: MatchMethod,
    pub members: Vec<NewMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    pub node_id: String,
    pub similarity: f64,
    pub added_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupCluster {
    pub cluster_id: String,
    pub canonical_id: String,
    pub method: MatchMethod,
    pub created_by: String,
    pub created_at: String,
    pub members: Vec<ClusterMember>,
}

pub fn get_cluster(conn: &Connection, cluster_id: &str) -> Result<DedupCluster> {
    let (canonical_id, method, created_by, created_at): (String, String, String, String) = conn
        .query_row(
            "SELECT canonical_id, method, created_by, created_at FROM dedup_clusters WHERE cluster_id = ?1",
            params![cluster_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("cluster {cluster_id}")))?;
    let mut stmt = conn.prepare(
        "SELECT node_id, similarity, added_at FROM dedup_members
         WHERE cluster_id = ?1 ORDER BY added_at, node_id",
    )?;
    let members = stmt
        .query_map(params![cluster_id], |row| {
            Ok(ClusterMember {
                node_id: row.get(0)?,
                similarity: row.get(1)?,
                added_at: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(DedupCluster {
        cluster_id: cluster_id.to_string(),
        canonical_id,
        method: MatchMethod::parse(&method)?,
        created_by,
        created_at,
        members,
    })
}

/// Creates a cluster around `canonical_id`. Members already clustered under
/// the same method are skipped; the canonical node itself must be free.
pub fn create_cluster(
    conn: &Connection,
    nodes: &dyn NodeStore,
    claims: Option<&Claims>,
    new: &NewCluster,
) -> Result<DedupCluster> {
    let claims = require_operator(claims)?;
    if nodes.get_node(&new.canonical_id)?.is_none() {
        return Err(Error::NotFound(format!("node {}", new.canonical_id)));
    }
    if let Some(bad) = new.members.iter().find(|m| !(0.0..=1.0).contains(&m.similarity)) {
        return Err(Error::InvalidInput(format!(
            "similarity {} of {} is outside [0, 1]",
            bad.similarity, bad.node_id
        )));
    }

    let cluster_id = Uuid::new_v4().to_string();
    let now = now_timestamp();
    let method = new.method.as_str();
    let tx = store::write_tx(conn)?;
    tx.execute(
        "INSERT INTO dedup_clusters (cluster_id, canonical_id, method, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![cluster_id, new.canonical_id, method, claims.user_id, now],
    )?;
    tx.execute(
        "INSERT INTO dedup_members (cluster_id, node_id, method, similarity, added_at)
         VALUES (?1, ?2, ?3, 1.0, ?4)",
        params![cluster_id, new.canonical_id, method, now],
    )
    .map_err(|err| {
        Error::conflict_on_constraint(err, format!("node {} is already clustered by {method}", new.canonical_id))
    })?;
    let mut added = 0;
    for member in new.members.iter().filter(|m| m.node_id != new.canonical_id) {
        added += tx.execute(
            "INSERT OR IGNORE INTO dedup_members (cluster_id, node_id, method, similarity, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![cluster_id, member.node_id, method, member.similarity, now],
        )?;
    }
    tx.commit()?;
    info!(
        cluster_id = %cluster_id,
        canonical_id = %new.canonical_id,
        method,
        added,
        skipped = new.members.len() - added,
        "dedup cluster created"
    );
    get_cluster(conn, &cluster_id)
}

pub fn remove_member(conn: &Connection, claims: Option<&Claims>, cluster_id: &str, node_id: &str) -> Result<()> {
    require_operator(claims)?;
    let cluster = get_cluster(conn, cluster_id)?;
    if cluster.canonical_id == node_id {
        return Err(Error::Conflict("the canonical member cannot be removed".into()));
    }
    let removed = conn.execute(
        "DELETE FROM dedup_members WHERE cluster_id = ?1 AND node_id = ?2",
        params![cluster_id, node_id],
    )?;
    if removed == 0 {
        return Err(Error::NotFound(format!("node {node_id} in cluster {cluster_id}")));
    }
    info!(cluster_id = %cluster_id, node_id = %node_id, "dedup member removed");
    Ok(())
}
