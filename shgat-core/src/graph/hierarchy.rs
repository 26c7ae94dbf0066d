//! Hierarchy level computation over the capability membership graph

use std::collections::HashMap;

use super::{Capability, Member};
use crate::{Error, Result};

/// Result of a full level computation
#[derive(Debug, Clone)]
pub struct LevelAssignment {
    /// Level per capability, indexed by arena position
    pub level_of: Vec<usize>,
    /// Arena indices per level, in capability insertion order
    pub by_level: Vec<Vec<usize>>,
    pub max_level: usize,
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    Unvisited,
    OnStack,
    Done,
}

/// Compute hierarchy levels for every capability.
///
/// Iterative depth-first visit with three colors and a memo. A capability
/// with no capability members sits at level 0; otherwise its level is one
/// above the maximum of its capability members, taken in member order. A
/// member found on the DFS stack aborts the whole computation with the
/// offending cycle path.
///
/// Runs in O(|C| + total member count).
pub fn compute_levels(
    capabilities: &[Capability],
    cap_index: &HashMap<String, usize>,
) -> Result<LevelAssignment> {
    let n = capabilities.len();
    let mut color = vec![Color::Unvisited; n];
    let mut level_of = vec![0usize; n];
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..n {
        if color[root] != Color::Unvisited {
            continue;
        }
        color[root] = Color::OnStack;
        stack.push((root, 0));

        while let Some(&(cap, member_pos)) = stack.last() {
            let members = &capabilities[cap].members;
            // Find the next capability-kind member from the cursor
            let mut next_child = None;
            let mut pos = member_pos;
            while pos < members.len() {
                if let Member::Capability(id) = &members[pos] {
                    let child = cap_index[id.as_str()];
                    match color[child] {
                        Color::Unvisited => {
                            next_child = Some(child);
                            break;
                        }
                        Color::OnStack => {
                            return Err(Error::HierarchyCycle {
                                path: cycle_path(&stack, child, capabilities),
                            });
                        }
                        Color::Done => {}
                    }
                }
                pos += 1;
            }
            // Resume after the child on the next iteration
            stack.last_mut().expect("stack is non-empty").1 = pos + 1;

            match next_child {
                Some(child) => {
                    color[child] = Color::OnStack;
                    stack.push((child, 0));
                }
                None => {
                    // All members settled; fold their levels
                    let mut level = 0;
                    for member in members {
                        if let Member::Capability(id) = member {
                            let child = cap_index[id.as_str()];
                            level = level.max(level_of[child] + 1);
                        }
                    }
                    level_of[cap] = level;
                    color[cap] = Color::Done;
                    stack.pop();
                }
            }
        }
    }

    let max_level = level_of.iter().copied().max().unwrap_or(0);
    let mut by_level = vec![Vec::new(); if n == 0 { 0 } else { max_level + 1 }];
    for (idx, level) in level_of.iter().enumerate() {
        by_level[*level].push(idx);
    }

    Ok(LevelAssignment {
        level_of,
        by_level,
        max_level,
    })
}

/// Cycle path from the first on-stack occurrence of `reentered`, closed back
/// on itself
fn cycle_path(
    stack: &[(usize, usize)],
    reentered: usize,
    capabilities: &[Capability],
) -> Vec<String> {
    let start = stack
        .iter()
        .position(|(cap, _)| *cap == reentered)
        .unwrap_or(0);
    let mut path: Vec<String> = stack[start..]
        .iter()
        .map(|(cap, _)| capabilities[*cap].id.clone())
        .collect();
    path.push(capabilities[reentered].id.clone());
    path
}
