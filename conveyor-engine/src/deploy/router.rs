// Deployment Router
// Pure mapping from branch name to deployment target

use crate::parser::models::{DeployConfig, RouteAction};

use std::collections::HashMap;
use std::fmt;

/// What a branch deploys to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployAction {
    Apply {
        environment: String,
        namespace: String,
        production: bool,
    },
    /// Deliberately deploys nothing
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentTarget {
    pub branch: String,
    pub action: DeployAction,
}

impl DeploymentTarget {
    pub fn is_noop(&self) -> bool {
        self.action == DeployAction::NoOp
    }

    pub fn is_production(&self) -> bool {
        matches!(self.action, DeployAction::Apply { production: true, .. })
    }

    pub fn namespace(&self) -> Option<&str> {
        match &self.action {
            DeployAction::Apply { namespace, .. } => Some(namespace),
            DeployAction::NoOp => None,
        }
    }
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            DeployAction::NoOp => write!(f, "{} -> no-op", self.branch),
            DeployAction::Apply {
                environment,
                namespace,
                production,
            } => {
                write!(f, "{} -> {} (namespace {})", self.branch, environment, namespace)?;
                if *production {
                    f.write_str(" [production]")?;
                }
                Ok(())
            }
        }
    }
}

/// Exact-match branch table with a non-production fallback
#[derive(Debug, Clone)]
pub struct DeploymentRouter {
    routes: HashMap<String, DeployAction>,
    default_environment: String,
    default_namespace: String,
}

impl DeploymentRouter {
    pub fn new(config: &DeployConfig) -> Self {
        let routes = config
            .routes
            .iter()
            .map(|route| {
                let action = match route.action {
                    RouteAction::Noop => DeployAction::NoOp,
                    RouteAction::Apply => {
                        let environment = route
                            .environment
                            .clone()
                            .unwrap_or_else(|| route.branch.clone());
                        DeployAction::Apply {
                            namespace: route
                                .namespace
                                .clone()
                                .unwrap_or_else(|| environment.clone()),
                            environment,
                            production: route.production,
                        }
                    }
                };
                (route.branch.clone(), action)
            })
            .collect();

        Self {
            routes,
            default_environment: config.default.environment.clone(),
            default_namespace: config.default.namespace.clone(),
        }
    }

    /// Route a branch. Every branch maps to exactly one target.
    pub fn route(&self, branch: &str) -> DeploymentTarget {
        let action = self
            .routes
            .get(branch)
            .cloned()
            .unwrap_or_else(|| DeployAction::Apply {
                environment: self.default_environment.clone(),
                namespace: self.default_namespace.clone(),
                production: false,
            });

        DeploymentTarget {
            branch: branch.to_string(),
            action,
        }
    }
}
