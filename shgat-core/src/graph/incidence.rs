//! Direct-membership incidence maps, forward and reverse
//!
//! Only direct membership is ever stored; no transitive closure exists
//! anywhere in the engine.

use std::collections::HashMap;

use super::{Capability, Member};

/// The four incidence maps, all keyed by arena indices.
///
/// Entries follow insertion order: capabilities in arena order, members in
/// member order, which keeps every traversal deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Incidence {
    /// Tool index -> level-0 capabilities that directly contain it
    pub tool_to_caps: Vec<Vec<usize>>,
    /// Capability index -> its direct tool member indices
    pub cap_to_tools: Vec<Vec<usize>>,
    /// Capability index -> capabilities that directly contain it
    pub child_to_parents: Vec<Vec<usize>>,
    /// Capability index -> its direct capability member indices
    pub parent_to_children: Vec<Vec<usize>>,
}

impl Incidence {
    /// Parents of a capability restricted to one hierarchy level
    pub fn parents_at_level<'a>(
        &'a self,
        child: usize,
        level: usize,
        capabilities: &'a [Capability],
    ) -> impl Iterator<Item = usize> + 'a {
        self.child_to_parents[child]
            .iter()
            .copied()
            .filter(move |p| capabilities[*p].level == level)
    }
}

/// Rebuild all four maps in a single pass over the capability arena.
///
/// Idempotent: rebuilding an unchanged store yields identical maps.
pub fn rebuild_incidence(
    num_tools: usize,
    capabilities: &[Capability],
    tool_index: &HashMap<String, usize>,
    cap_index: &HashMap<String, usize>,
) -> Incidence {
    let n = capabilities.len();
    let mut incidence = Incidence {
        tool_to_caps: vec![Vec::new(); num_tools],
        cap_to_tools: vec![Vec::new(); n],
        child_to_parents: vec![Vec::new(); n],
        parent_to_children: vec![Vec::new(); n],
    };

    for (parent, cap) in capabilities.iter().enumerate() {
        for member in &cap.members {
            match member {
                Member::Tool(id) => {
                    let tool = tool_index[id.as_str()];
                    incidence.cap_to_tools[parent].push(tool);
                    if cap.level == 0 {
                        incidence.tool_to_caps[tool].push(parent);
                    }
                }
                Member::Capability(id) => {
                    let child = cap_index[id.as_str()];
                    incidence.parent_to_children[parent].push(child);
                    incidence.child_to_parents[child].push(parent);
                }
            }
        }
    }

    incidence
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn cap(id: &str, level: usize, members: Vec<Member>) -> Capability {
        Capability {
            id: id.to_string(),
            embedding: DVector::zeros(4),
            members,
            success_rate: 1.0,
            level,
        }
    }

    fn build(caps: &[Capability], num_tools: usize) -> Incidence {
        let tool_index: HashMap<String, usize> = (0..num_tools)
            .map(|i| (format!("t{}", i + 1), i))
            .collect();
        let cap_index: HashMap<String, usize> = caps
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.clone(), i))
            .collect();
        rebuild_incidence(num_tools, caps, &tool_index, &cap_index)
    }

    #[test]
    fn test_forward_maps_equal_direct_members() {
        let caps = vec![
            cap("a", 0, vec![Member::Tool("t1".into()), Member::Tool("t2".into())]),
            cap("b", 0, vec![Member::Tool("t2".into())]),
            cap(
                "m",
                1,
                vec![
                    Member::Capability("a".into()),
                    Member::Capability("b".into()),
                ],
            ),
        ];
        let incidence = build(&caps, 2);
        assert_eq!(incidence.cap_to_tools[0], vec![0, 1]);
        assert_eq!(incidence.tool_to_caps[1], vec![0, 1]);
        assert_eq!(incidence.parent_to_children[2], vec![0, 1]);
        assert_eq!(incidence.child_to_parents[0], vec![2]);
        assert_eq!(incidence.child_to_parents[1], vec![2]);
        // No transitive closure: the meta capability has no tool entries
        assert!(incidence.cap_to_tools[2].is_empty());
    }

    #[test]
    fn test_tool_members_of_higher_levels_stay_out_of_i0() {
        let caps = vec![
            cap("a", 0, vec![Member::Tool("t1".into())]),
            cap(
                "m",
                1,
                vec![Member::Capability("a".into()), Member::Tool("t1".into())],
            ),
        ];
        let incidence = build(&caps, 1);
        // t1 belongs to I0 only through the level-0 capability
        assert_eq!(incidence.tool_to_caps[0], vec![0]);
        // The direct tool membership of the meta capability is still recorded
        assert_eq!(incidence.cap_to_tools[1], vec![0]);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let caps = vec![
            cap("a", 0, vec![Member::Tool("t1".into())]),
            cap("m", 1, vec![Member::Capability("a".into())]),
        ];
        let first = build(&caps, 1);
        let second = build(&caps, 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_parents_at_level_filters() {
        let caps = vec![
            cap("a", 0, vec![]),
            cap("m1", 1, vec![Member::Capability("a".into())]),
            cap(
                "m2",
                2,
                vec![
                    Member::Capability("a".into()),
                    Member::Capability("m1".into()),
                ],
            ),
        ];
        let incidence = build(&caps, 0);
        let level1: Vec<usize> = incidence.parents_at_level(0, 1, &caps).collect();
        let level2: Vec<usize> = incidence.parents_at_level(0, 2, &caps).collect();
        assert_eq!(level1, vec![1]);
        assert_eq!(level2, vec![2]);
    }
}
