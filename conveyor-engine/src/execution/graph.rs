// Job Graph
// Dependency graph of a pipeline's jobs, validated before anything runs

use crate::parser::models::{Job, Pipeline};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
    /// Job names forming the cycle, first name repeated at the end
    pub cycle: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to unknown job
    UnknownDependency,
    /// Invalid pipeline structure
    InvalidStructure,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(cycle: Vec<String>) -> Self {
        Self {
            message: format!("circular dependency detected: {}", cycle.join(" -> ")),
            kind: GraphErrorKind::CyclicDependency,
            cycle,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
            cycle: Vec::new(),
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidStructure,
            cycle: Vec::new(),
        }
    }
}

/// A node representing a job in the graph
#[derive(Debug, Clone)]
pub struct JobNode {
    pub job: Job,
    /// Names of jobs this job requires
    pub dependencies: Vec<String>,
}

impl JobNode {
    pub fn name(&self) -> &str {
        &self.job.name
    }
}

/// Validated, acyclic job graph in declaration order
#[derive(Debug, Clone)]
pub struct JobGraph {
    nodes: Vec<JobNode>,
    indices: HashMap<String, usize>,
}

impl JobGraph {
    /// Build the graph, rejecting duplicate names, unknown prerequisites and
    /// cycles
    pub fn from_pipeline(pipeline: &Pipeline) -> Result<Self, GraphError> {
        Self::from_jobs(&pipeline.jobs)
    }

    pub fn from_jobs(jobs: &[Job]) -> Result<Self, GraphError> {
        let mut indices = HashMap::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            if indices.insert(job.name.clone(), i).is_some() {
                return Err(GraphError::invalid_structure(format!(
                    "job '{}' is declared more than once",
                    job.name
                )));
            }
        }

        let mut nodes = Vec::with_capacity(jobs.len());
        for job in jobs {
            let mut dependencies = Vec::with_capacity(job.requires.len());
            for dep in &job.requires {
                if !indices.contains_key(dep) {
                    return Err(GraphError::unknown_dependency(format!(
                        "job '{}' requires unknown job '{}'",
                        job.name, dep
                    )));
                }
                if !dependencies.contains(dep) {
                    dependencies.push(dep.clone());
                }
            }
            nodes.push(JobNode {
                job: job.clone(),
                dependencies,
            });
        }

        let graph = Self { nodes, indices };
        graph.detect_cycles()?;
        Ok(graph)
    }

    /// Detect cycles using DFS, reporting the full cycle path
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();

        for node in &self.nodes {
            if !visited.contains(node.name()) {
                if let Some(cycle) = self.dfs_cycle(node, &mut visited, &mut path) {
                    return Err(GraphError::cyclic(cycle));
                }
            }
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a JobNode,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node.name());
        path.push(node.name());

        for dep in &node.dependencies {
            if let Some(pos) = path.iter().position(|n| *n == dep.as_str()) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep.as_str()) {
                if let Some(next) = self.get(dep) {
                    if let Some(cycle) = self.dfs_cycle(next, visited, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&JobNode> {
        self.indices.get(name).map(|&idx| &self.nodes[idx])
    }

    /// Jobs that list `name` as a prerequisite, in declaration order
    pub fn dependents(&self, name: &str) -> Vec<&JobNode> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.iter().any(|d| d == name))
            .collect()
    }

    /// Jobs with no prerequisites
    pub fn roots(&self) -> Vec<&JobNode> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.is_empty())
            .collect()
    }

    /// Kahn's algorithm, ties broken by declaration order
    pub fn topological_order(&self) -> Vec<&JobNode> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(idx) = queue.pop_front() {
            let node = &self.nodes[idx];
            result.push(node);

            for (i, other) in self.nodes.iter().enumerate() {
                if other.dependencies.iter().any(|d| d == node.name()) {
                    in_degree[i] -= 1;
                    if in_degree[i] == 0 {
                        queue.push_back(i);
                    }
                }
            }
        }

        result
    }

    /// Group jobs into levels; every job's prerequisites sit in earlier levels
    pub fn parallel_levels(&self) -> Vec<Vec<&JobNode>> {
        let mut levels: Vec<Vec<&JobNode>> = Vec::new();
        let mut assigned: HashMap<&str, usize> = HashMap::new();

        for node in self.topological_order() {
            let level = node
                .dependencies
                .iter()
                .filter_map(|d| assigned.get(d.as_str()))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);

            assigned.insert(node.name(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node);
        }

        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::Step;

    fn job(name: &str, requires: &[&str]) -> Job {
        Job {
            name: name.to_string(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
            steps: vec![Step::run("step", "true")],
            ..Default::default()
        }
    }

    fn names(nodes: &[&JobNode]) -> Vec<String> {
        nodes.iter().map(|n| n.name().to_string()).collect()
    }

    #[test]
    fn test_fan_out_fan_in_levels() {
        let graph = JobGraph::from_jobs(&[
            job("build", &[]),
            job("unit", &["build"]),
            job("lint", &["build"]),
            job("publish", &["unit", "lint"]),
        ])
        .unwrap();

        let levels = graph.parallel_levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(names(&levels[0]), vec!["build"]);
        assert_eq!(names(&levels[1]), vec!["unit", "lint"]);
        assert_eq!(names(&levels[2]), vec!["publish"]);

        assert_eq!(names(&graph.dependents("build")), vec!["unit", "lint"]);
        assert_eq!(names(&graph.roots()), vec!["build"]);
    }

    #[test]
    fn test_topological_order_respects_requires() {
        let graph = JobGraph::from_jobs(&[
            job("deploy", &["test"]),
            job("test", &["build"]),
            job("build", &[]),
        ])
        .unwrap();

        assert_eq!(
            names(&graph.topological_order()),
            vec!["build", "test", "deploy"]
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let err = JobGraph::from_jobs(&[job("test", &["build"])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
        assert!(err.message.contains("unknown job 'build'"));
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = JobGraph::from_jobs(&[
            job("a", &["c"]),
            job("b", &["a"]),
            job("c", &["b"]),
            job("d", &[]),
        ])
        .unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert_eq!(err.cycle, vec!["a", "c", "b", "a"]);
        assert!(err.to_string().contains("a -> c -> b -> a"));
    }

    #[test]
    fn test_self_cycle() {
        let err = JobGraph::from_jobs(&[job("a", &["a"])]).unwrap_err();
        assert_eq!(err.cycle, vec!["a", "a"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = JobGraph::from_jobs(&[job("a", &[]), job("a", &[])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::InvalidStructure);
    }

    #[test]
    fn test_duplicate_requires_collapsed() {
        let graph = JobGraph::from_jobs(&[job("a", &[]), job("b", &["a", "a"])]).unwrap();
        assert_eq!(graph.get("b").unwrap().dependencies, vec!["a"]);
    }
}
