//! Dependency graph builder for execution plans.
//!
//! Converts a plan's flat (or, for composite mode, nested) call list into
//! an acyclic graph of execution order. All validation happens here,
//! before any call runs: duplicate ids, dangling or self dependencies,
//! and cycles reject the whole plan with zero side effects.
//!
//! Nodes live in an arena indexed by position; the engine's state table is
//! keyed by the same indices.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::{PlanError, PlanResult};
use crate::plan::{ExecutionMode, ExecutionPlan, ToolCall};

/// One executable node in the graph. Composite group containers are
/// expanded away during construction and never become nodes.
#[derive(Debug, Clone)]
pub struct CallNode {
    pub call: ToolCall,
}

/// Directed acyclic graph over a plan's calls.
#[derive(Debug)]
pub struct CallGraph {
    nodes: Vec<CallNode>,
    index: HashMap<String, usize>,
    adjacency_out: Vec<Vec<usize>>,
    adjacency_in: Vec<Vec<usize>>,
}

/// Bookkeeping produced while flattening one composite group.
struct GroupExpansion {
    /// Leaf ids a caller depending on the group id should wait for.
    exits: Vec<String>,
}

impl CallGraph {
    /// Build and validate the graph for a plan.
    pub fn build(plan: &ExecutionPlan) -> PlanResult<Self> {
        if plan.calls.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        if plan.mode == ExecutionMode::Single && plan.calls.len() != 1 {
            return Err(PlanError::SingleModeArity(plan.calls.len()));
        }

        let mut flat: Vec<ToolCall> = Vec::new();
        let mut groups: HashMap<String, GroupExpansion> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();

        for call in &plan.calls {
            flatten(call, &[], &mut flat, &mut groups, &mut seen)?;
        }

        // Resolve dependencies on group ids to the group's exit calls.
        for call in &mut flat {
            let mut resolved = Vec::new();
            let mut dedup = HashSet::new();
            for dep in call.depends_on.drain(..) {
                match groups.get(&dep) {
                    Some(expansion) => {
                        for exit in &expansion.exits {
                            if dedup.insert(exit.clone()) {
                                resolved.push(exit.clone());
                            }
                        }
                    }
                    None => {
                        if dedup.insert(dep.clone()) {
                            resolved.push(dep);
                        }
                    }
                }
            }
            call.depends_on = resolved;
        }

        // Sequential mode: chain consecutive calls that declare no
        // dependencies of their own, preserving list order.
        if plan.mode == ExecutionMode::Sequential {
            for i in 1..flat.len() {
                if flat[i].depends_on.is_empty() {
                    let prev = flat[i - 1].tool_id.clone();
                    flat[i].depends_on.push(prev);
                }
            }
        }

        let index: HashMap<String, usize> = flat
            .iter()
            .enumerate()
            .map(|(i, c)| (c.tool_id.clone(), i))
            .collect();

        let mut adjacency_out = vec![Vec::new(); flat.len()];
        let mut adjacency_in = vec![Vec::new(); flat.len()];

        for (to, call) in flat.iter().enumerate() {
            for dep in &call.depends_on {
                if dep == &call.tool_id {
                    return Err(PlanError::SelfDependency(call.tool_id.clone()));
                }
                let from = *index.get(dep).ok_or_else(|| PlanError::UnknownDependency {
                    tool_id: call.tool_id.clone(),
                    depends_on: dep.clone(),
                })?;
                adjacency_out[from].push(to);
                adjacency_in[to].push(from);
            }
        }

        let graph = Self {
            nodes: flat.into_iter().map(|call| CallNode { call }).collect(),
            index,
            adjacency_out,
            adjacency_in,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: usize) -> &CallNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[CallNode] {
        &self.nodes
    }

    pub fn index_of(&self, tool_id: &str) -> Option<usize> {
        self.index.get(tool_id).copied()
    }

    /// Direct predecessors of a node.
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.adjacency_in[idx]
    }

    /// Direct successors of a node.
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.adjacency_out[idx]
    }

    /// Nodes with no dependencies.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.adjacency_in[i].is_empty())
            .collect()
    }

    /// All transitive successors of a node.
    pub fn transitive_dependents(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from_iter(self.adjacency_out[idx].iter().copied());
        while let Some(next) = queue.pop_front() {
            if visited.insert(next) {
                out.push(next);
                queue.extend(self.adjacency_out[next].iter().copied());
            }
        }
        out
    }

    /// Kahn topological sort; the order calls would start with unbounded
    /// concurrency removed. Used for dry-run display.
    pub fn execution_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.adjacency_in.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &next in &self.adjacency_out[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        order
    }

    /// Depth-first cycle check with a recursion stack.
    fn check_acyclic(&self) -> PlanResult<()> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        for idx in 0..self.nodes.len() {
            if !visited.contains(&idx) {
                self.cycle_dfs(idx, &mut visited, &mut rec_stack)?;
            }
        }
        Ok(())
    }

    fn cycle_dfs(
        &self,
        idx: usize,
        visited: &mut HashSet<usize>,
        rec_stack: &mut HashSet<usize>,
    ) -> PlanResult<()> {
        visited.insert(idx);
        rec_stack.insert(idx);

        for &next in &self.adjacency_out[idx] {
            if !visited.contains(&next) {
                self.cycle_dfs(next, visited, rec_stack)?;
            } else if rec_stack.contains(&next) {
                return Err(PlanError::CycleDetected(format!(
                    "{} -> {}",
                    self.nodes[idx].call.tool_id, self.nodes[next].call.tool_id
                )));
            }
        }

        rec_stack.remove(&idx);
        Ok(())
    }
}

/// Flatten one call (leaf or composite group) into `flat`.
///
/// `inherited` carries the enclosing group's `depends_on`, attached to
/// every nested call with no predecessor inside its own group (fan-in).
fn flatten(
    call: &ToolCall,
    inherited: &[String],
    flat: &mut Vec<ToolCall>,
    groups: &mut HashMap<String, GroupExpansion>,
    seen: &mut HashSet<String>,
) -> PlanResult<()> {
    if !seen.insert(call.tool_id.clone()) {
        return Err(PlanError::DuplicateToolId(call.tool_id.clone()));
    }

    if !call.is_group() {
        let mut leaf = call.clone();
        if leaf.depends_on.is_empty() {
            leaf.depends_on = inherited.to_vec();
        }
        flat.push(leaf);
        return Ok(());
    }

    if call.calls.is_empty() {
        return Err(PlanError::EmptyGroup(call.tool_id.clone()));
    }

    // Merge the group's own dependencies into what its roots inherit.
    let mut inner_inherited = inherited.to_vec();
    inner_inherited.extend(call.depends_on.iter().cloned());

    let member_ids: HashSet<&str> = call.calls.iter().map(|c| c.tool_id.as_str()).collect();

    // A member has an internal predecessor if it depends on a sibling; a
    // member has an internal successor if some sibling depends on it.
    let with_internal_successor: HashSet<&str> = call
        .calls
        .iter()
        .flat_map(|c| c.depends_on.iter())
        .filter(|dep| member_ids.contains(dep.as_str()))
        .map(String::as_str)
        .collect();

    let mut exits = Vec::new();
    for member in &call.calls {
        let has_internal_pred = member
            .depends_on
            .iter()
            .any(|dep| member_ids.contains(dep.as_str()));
        let member_inherited = if has_internal_pred { &[][..] } else { &inner_inherited[..] };

        // Sink members become the group's exits; a sink that is itself a
        // group resolves to its own exits after the recursive call below.
        if !with_internal_successor.contains(member.tool_id.as_str()) {
            exits.push(member.tool_id.clone());
        }
        flatten(member, member_inherited, flat, groups, seen)?;
    }

    // Resolve exit entries that name nested groups down to leaf ids.
    let resolved_exits: Vec<String> = exits
        .into_iter()
        .flat_map(|id| match groups.get(&id) {
            Some(inner) => inner.exits.clone(),
            None => vec![id],
        })
        .collect();

    groups.insert(
        call.tool_id.clone(),
        GroupExpansion {
            exits: resolved_exits,
        },
    );
    Ok(())
}
