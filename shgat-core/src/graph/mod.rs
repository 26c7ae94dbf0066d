//! Arena-indexed store for tools, capabilities, and their membership structure

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, Result};

pub mod hierarchy;
pub mod incidence;

pub use hierarchy::LevelAssignment;
pub use incidence::Incidence;

/// A leaf primitive with a description embedding; never contains members
#[derive(Debug, Clone)]
pub struct Tool {
    pub id: String,
    pub embedding: DVector<f32>,
}

/// Tagged member reference; never a raw identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Member {
    Tool(String),
    Capability(String),
}

impl Member {
    pub fn id(&self) -> &str {
        match self {
            Member::Tool(id) | Member::Capability(id) => id,
        }
    }
}

/// A reusable skill composed of tools and/or other capabilities
#[derive(Debug, Clone)]
pub struct Capability {
    pub id: String,
    pub embedding: DVector<f32>,
    pub members: Vec<Member>,
    pub success_rate: f32,
    pub level: usize,
}

/// Dense store keyed by insertion-order indices.
///
/// The hierarchy level map and the incidence maps are derived state,
/// recomputed on every membership change; mutations that would break an
/// invariant leave the store untouched.
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    embedding_dim: usize,
    tools: Vec<Tool>,
    tool_index: HashMap<String, usize>,
    capabilities: Vec<Capability>,
    cap_index: HashMap<String, usize>,
    by_level: Vec<Vec<usize>>,
    incidence: Incidence,
}

impl GraphStore {
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            ..Default::default()
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn num_tools(&self) -> usize {
        self.tools.len()
    }

    pub fn num_capabilities(&self) -> usize {
        self.capabilities.len()
    }

    /// Number of inhabited hierarchy levels (`max_level + 1`, or 0 when empty)
    pub fn num_levels(&self) -> usize {
        self.by_level.len()
    }

    pub fn max_level(&self) -> usize {
        self.by_level.len().saturating_sub(1)
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn tool_idx(&self, id: &str) -> Option<usize> {
        self.tool_index.get(id).copied()
    }

    pub fn capability_idx(&self, id: &str) -> Option<usize> {
        self.cap_index.get(id).copied()
    }

    pub fn capability(&self, id: &str) -> Option<&Capability> {
        self.capability_idx(id).map(|i| &self.capabilities[i])
    }

    /// Capability arena indices at a level, in insertion order
    pub fn caps_at_level(&self, level: usize) -> &[usize] {
        self.by_level.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incidence(&self) -> &Incidence {
        &self.incidence
    }

    fn validate_embedding(&self, embedding: &[f32]) -> Result<()> {
        if embedding.is_empty() {
            return Err(Error::EmptyInput("embedding".to_string()));
        }
        if embedding.len() != self.embedding_dim {
            return Err(Error::DimensionMismatch {
                expected: self.embedding_dim,
                actual: embedding.len(),
            });
        }
        if !embedding.iter().all(|v| v.is_finite()) {
            return Err(Error::NonFiniteInput("embedding".to_string()));
        }
        Ok(())
    }

    fn validate_members(&self, members: &[Member]) -> Result<()> {
        for member in members {
            let known = match member {
                Member::Tool(id) => self.tool_index.contains_key(id),
                Member::Capability(id) => self.cap_index.contains_key(id),
            };
            if !known {
                return Err(Error::UnknownMember(member.id().to_string()));
            }
        }
        Ok(())
    }

    pub fn insert_tool(&mut self, id: &str, embedding: Vec<f32>) -> Result<()> {
        if id.is_empty() {
            return Err(Error::EmptyInput("tool id".to_string()));
        }
        self.validate_embedding(&embedding)?;
        if self.tool_index.contains_key(id) {
            return Err(Error::DuplicateId(id.to_string()));
        }
        self.tool_index.insert(id.to_string(), self.tools.len());
        self.tools.push(Tool {
            id: id.to_string(),
            embedding: DVector::from_vec(embedding),
        });
        // Tools at insertion never appear in any membership yet; only the
        // incidence map widths change.
        self.rebuild_derived_state()
            .expect("inserting a tool cannot create a cycle");
        Ok(())
    }

    pub fn insert_capability(
        &mut self,
        id: &str,
        embedding: Vec<f32>,
        members: Vec<Member>,
        success_rate: f32,
    ) -> Result<()> {
        if id.is_empty() {
            return Err(Error::EmptyInput("capability id".to_string()));
        }
        self.validate_embedding(&embedding)?;
        if self.cap_index.contains_key(id) || self.tool_index.contains_key(id) {
            return Err(Error::DuplicateId(id.to_string()));
        }
        self.validate_members(&members)?;
        validate_success_rate(success_rate)?;

        self.cap_index.insert(id.to_string(), self.capabilities.len());
        self.capabilities.push(Capability {
            id: id.to_string(),
            embedding: DVector::from_vec(embedding),
            members,
            success_rate,
            level: 0,
        });

        if let Err(err) = self.rebuild_derived_state() {
            // Roll back: the store must be bit-identical to its pre-call state.
            let cap = self.capabilities.pop().expect("capability was just pushed");
            self.cap_index.remove(&cap.id);
            self.rebuild_derived_state()
                .expect("pre-call state was acyclic");
            return Err(err);
        }
        Ok(())
    }

    /// Replace the member set of an existing capability
    pub fn replace_members(&mut self, id: &str, members: Vec<Member>) -> Result<()> {
        let idx = self
            .cap_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownCapability(id.to_string()))?;
        self.validate_members(&members)?;

        let previous = std::mem::replace(&mut self.capabilities[idx].members, members);
        if let Err(err) = self.rebuild_derived_state() {
            self.capabilities[idx].members = previous;
            self.rebuild_derived_state()
                .expect("pre-call state was acyclic");
            return Err(err);
        }
        Ok(())
    }

    pub fn update_success_rate(&mut self, id: &str, rate: f32) -> Result<()> {
        validate_success_rate(rate)?;
        let idx = self
            .cap_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownCapability(id.to_string()))?;
        self.capabilities[idx].success_rate = rate;
        Ok(())
    }

    /// Recompute hierarchy levels and incidence maps from the member sets
    fn rebuild_derived_state(&mut self) -> Result<()> {
        let assignment = hierarchy::compute_levels(&self.capabilities, &self.cap_index)?;
        for (idx, level) in assignment.level_of.iter().enumerate() {
            self.capabilities[idx].level = *level;
        }
        self.by_level = assignment.by_level;
        self.incidence = incidence::rebuild_incidence(
            self.tools.len(),
            &self.capabilities,
            &self.tool_index,
            &self.cap_index,
        );
        Ok(())
    }
}

fn validate_success_rate(rate: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) || !rate.is_finite() {
        return Err(Error::Config(format!(
            "success_rate must be within [0, 1], got {}",
            rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_tools() -> GraphStore {
        let mut store = GraphStore::new(4);
        store.insert_tool("t1", vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        store.insert_tool("t2", vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        store.insert_tool("t3", vec![0.0, 0.0, 1.0, 0.0]).unwrap();
        store
    }

    #[test]
    fn test_insert_tool_rejects_duplicates_and_bad_dims() {
        let mut store = store_with_tools();
        assert!(matches!(
            store.insert_tool("t1", vec![0.0; 4]),
            Err(Error::DuplicateId(_))
        ));
        assert!(matches!(
            store.insert_tool("t4", vec![0.0; 3]),
            Err(Error::DimensionMismatch { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            store.insert_tool("", vec![0.0; 4]),
            Err(Error::EmptyInput(_))
        ));
    }

    #[test]
    fn test_insert_rejects_non_finite_embeddings() {
        let mut store = store_with_tools();
        assert!(matches!(
            store.insert_tool("t4", vec![0.0, f32::NAN, 0.0, 0.0]),
            Err(Error::NonFiniteInput(_))
        ));
        assert!(matches!(
            store.insert_capability(
                "cap_x",
                vec![0.0, 0.0, f32::INFINITY, 0.0],
                vec![Member::Tool("t1".to_string())],
                1.0,
            ),
            Err(Error::NonFiniteInput(_))
        ));
        assert_eq!(store.num_tools(), 3);
        assert_eq!(store.num_capabilities(), 0);
    }

    #[test]
    fn test_insert_capability_rejects_unknown_members() {
        let mut store = store_with_tools();
        let err = store.insert_capability(
            "cap_x",
            vec![0.0; 4],
            vec![Member::Tool("missing".to_string())],
            1.0,
        );
        assert!(matches!(err, Err(Error::UnknownMember(id)) if id == "missing"));
        assert_eq!(store.num_capabilities(), 0);
    }

    #[test]
    fn test_leaf_levels_and_tool_incidence() {
        let mut store = store_with_tools();
        store
            .insert_capability(
                "cap_a",
                vec![0.5; 4],
                vec![Member::Tool("t1".into()), Member::Tool("t2".into())],
                1.0,
            )
            .unwrap();
        store
            .insert_capability("cap_b", vec![0.5; 4], vec![Member::Tool("t3".into())], 1.0)
            .unwrap();

        assert_eq!(store.capability("cap_a").unwrap().level, 0);
        assert_eq!(store.capability("cap_b").unwrap().level, 0);
        assert_eq!(store.max_level(), 0);

        let incidence = store.incidence();
        let t1 = store.tool_idx("t1").unwrap();
        let t3 = store.tool_idx("t3").unwrap();
        let cap_a = store.capability_idx("cap_a").unwrap();
        let cap_b = store.capability_idx("cap_b").unwrap();
        assert_eq!(incidence.tool_to_caps[t1], vec![cap_a]);
        assert_eq!(incidence.tool_to_caps[t3], vec![cap_b]);
    }

    #[test]
    fn test_meta_level_and_parent_incidence() {
        let mut store = store_with_tools();
        store
            .insert_capability(
                "cap_a",
                vec![0.5; 4],
                vec![Member::Tool("t1".into()), Member::Tool("t2".into())],
                1.0,
            )
            .unwrap();
        store
            .insert_capability("cap_b", vec![0.5; 4], vec![Member::Tool("t3".into())], 1.0)
            .unwrap();
        store
            .insert_capability(
                "meta_ab",
                vec![0.25; 4],
                vec![
                    Member::Capability("cap_a".into()),
                    Member::Capability("cap_b".into()),
                ],
                1.0,
            )
            .unwrap();

        assert_eq!(store.capability("meta_ab").unwrap().level, 1);
        assert_eq!(store.max_level(), 1);

        let cap_a = store.capability_idx("cap_a").unwrap();
        let cap_b = store.capability_idx("cap_b").unwrap();
        let meta = store.capability_idx("meta_ab").unwrap();
        let incidence = store.incidence();
        assert_eq!(incidence.child_to_parents[cap_a], vec![meta]);
        assert_eq!(incidence.child_to_parents[cap_b], vec![meta]);
        assert_eq!(incidence.parent_to_children[meta], vec![cap_a, cap_b]);
    }

    #[test]
    fn test_cycle_rejection_restores_store() {
        let mut store = store_with_tools();
        store
            .insert_capability("cap_a", vec![0.5; 4], vec![Member::Tool("t1".into())], 1.0)
            .unwrap();
        store
            .insert_capability(
                "meta_ab",
                vec![0.25; 4],
                vec![Member::Capability("cap_a".into())],
                1.0,
            )
            .unwrap();

        let before_levels: Vec<usize> =
            store.capabilities().iter().map(|c| c.level).collect();
        let before_incidence = store.incidence().clone();

        let err = store.replace_members(
            "cap_a",
            vec![Member::Capability("meta_ab".into())],
        );
        match err {
            Err(Error::HierarchyCycle { path }) => {
                assert!(path.contains(&"cap_a".to_string()));
                assert!(path.contains(&"meta_ab".to_string()));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }

        let after_levels: Vec<usize> =
            store.capabilities().iter().map(|c| c.level).collect();
        assert_eq!(before_levels, after_levels);
        assert_eq!(&before_incidence, store.incidence());
        assert_eq!(
            store.capability("cap_a").unwrap().members,
            vec![Member::Tool("t1".into())]
        );
    }

    #[test]
    fn test_update_success_rate_bounds() {
        let mut store = store_with_tools();
        store
            .insert_capability("cap_a", vec![0.5; 4], vec![Member::Tool("t1".into())], 0.5)
            .unwrap();
        store.update_success_rate("cap_a", 0.9).unwrap();
        assert_eq!(store.capability("cap_a").unwrap().success_rate, 0.9);
        assert!(store.update_success_rate("cap_a", 1.5).is_err());
        assert!(store.update_success_rate("missing", 0.5).is_err());
    }

    #[test]
    fn test_member_serde_tagging() {
        let member = Member::Tool("t1".to_string());
        let json = serde_json::to_string(&member).unwrap();
        assert_eq!(json, r#"{"kind":"tool","id":"t1"}"#);
        let back: Member = serde_json::from_str(&json).unwrap();
        assert_eq!(back, member);
    }
}
