// Pipeline YAML Loader
// Parses pipeline files and checks them for semantic problems before any job runs

use crate::parser::error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
use crate::parser::models::*;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Pipeline definition parser
pub struct PipelineParser;

impl PipelineParser {
    /// Parse a pipeline from a YAML string
    pub fn parse(content: &str) -> ParseResult<Pipeline> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    /// Parse a pipeline from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<Pipeline> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ParseError::io(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::parse(&content)
    }

    /// Parse and validate in one go, folding validation errors into a ParseError
    pub fn load<P: AsRef<Path>>(path: P) -> ParseResult<Pipeline> {
        let pipeline = Self::parse_file(path)?;

        if let Err(errors) = PipelineValidator::validate(&pipeline) {
            let message = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ParseError::new(message, 0, 0).with_kind(ParseErrorKind::ValidationError));
        }

        Ok(pipeline)
    }
}

/// Semantic checks that serde cannot express
pub struct PipelineValidator;

impl PipelineValidator {
    pub fn validate(pipeline: &Pipeline) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if pipeline.jobs.is_empty() {
            errors.push(
                ValidationError::new("pipeline must declare at least one job", "jobs")
                    .with_suggestion("add a 'jobs:' list"),
            );
        }

        let mut seen = HashSet::new();
        for (i, job) in pipeline.jobs.iter().enumerate() {
            let path = format!("jobs[{}]", i);
            if job.name.trim().is_empty() {
                errors.push(ValidationError::new("job name must not be empty", &path));
            } else if !seen.insert(job.name.as_str()) {
                errors.push(ValidationError::new(
                    format!("duplicate job name '{}'", job.name),
                    &path,
                ));
            }
            Self::validate_job(pipeline, job, &path, &mut errors);
        }

        if let Some(deploy) = &pipeline.deploy {
            Self::validate_deploy(deploy, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_job(pipeline: &Pipeline, job: &Job, path: &str, errors: &mut Vec<ValidationError>) {
        if job.steps.is_empty() {
            errors.push(
                ValidationError::new("job must have steps", path)
                    .with_suggestion("add 'steps:' to define what the job should do"),
            );
        }

        let mut requires = HashSet::new();
        for dep in &job.requires {
            if dep == &job.name {
                errors.push(ValidationError::new(
                    format!("job '{}' requires itself", job.name),
                    format!("{}.requires", path),
                ));
            } else if pipeline.job(dep).is_none() {
                errors.push(ValidationError::new(
                    format!("job '{}' requires unknown job '{}'", job.name, dep),
                    format!("{}.requires", path),
                ));
            }
            if !requires.insert(dep.as_str()) {
                errors.push(ValidationError::new(
                    format!("prerequisite '{}' listed twice", dep),
                    format!("{}.requires", path),
                ));
            }
        }

        for (i, step) in job.steps.iter().enumerate() {
            let step_path = format!("{}.steps[{}]", path, i);

            if let Some(flag) = &step.gate {
                if flag.trim().is_empty() {
                    errors.push(ValidationError::new("gate flag name is empty", &step_path));
                }
            }

            match &step.action {
                StepAction::Run(run) if run.run.trim().is_empty() => {
                    errors.push(ValidationError::new("run command is empty", &step_path));
                }
                StepAction::RestoreCache(RestoreCacheStep { restore_cache: spec })
                | StepAction::SaveCache(SaveCacheStep { save_cache: spec }) => {
                    if spec.key.trim().is_empty() {
                        errors.push(ValidationError::new("cache key is empty", &step_path));
                    }
                }
                StepAction::Publish(publish) => {
                    let count = publish.publish.credentials.len();
                    if count != 0 && count != 2 {
                        errors.push(
                            ValidationError::new(
                                "publish credentials must name exactly two variables",
                                &step_path,
                            )
                            .with_suggestion("credentials: [REGISTRY_USER, REGISTRY_PASSWORD]"),
                        );
                    }
                }
                StepAction::Deploy(_) if pipeline.deploy.is_none() => {
                    errors.push(
                        ValidationError::new(
                            "deploy step used but the pipeline has no 'deploy:' table",
                            &step_path,
                        )
                        .with_suggestion("add a top-level 'deploy:' section with routes"),
                    );
                }
                _ => {}
            }
        }
    }

    fn validate_deploy(deploy: &DeployConfig, errors: &mut Vec<ValidationError>) {
        if deploy.template.trim().is_empty() {
            errors.push(ValidationError::new("manifest template path is empty", "deploy.template"));
        }
        if deploy.placeholder.is_empty() {
            errors.push(ValidationError::new("placeholder token is empty", "deploy.placeholder"));
        }

        let mut branches = HashSet::new();
        for (i, route) in deploy.routes.iter().enumerate() {
            let path = format!("deploy.routes[{}]", i);
            if !branches.insert(route.branch.as_str()) {
                errors.push(ValidationError::new(
                    format!("branch '{}' routed twice", route.branch),
                    &path,
                ));
            }
            if route.action == RouteAction::Apply && route.environment.is_none() {
                errors.push(
                    ValidationError::new("apply route needs an environment", &path)
                        .with_suggestion("set 'environment:' or use 'action: noop'"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: toolkit
jobs:
  - name: build-image
    steps:
      - restore_cache: { key: "image-{{branch}}", path: image.tar }
      - run: docker build -t toolkit .
      - save_cache: { key: "image-{{branch}}", path: image.tar }
  - name: test
    requires: [build-image]
    steps:
      - run: ./run-tests.sh
        on_failure: continue
        artifacts: [test-output]
  - name: publish
    requires: [test]
    branches: { only: [master] }
    steps:
      - publish: { image: toolkit, credentials: [DOCKER_USER, DOCKER_PASS] }
deploy:
  template: k8s/deployment.yaml
  routes:
    - { branch: develop, environment: staging, namespace: staging }
    - { branch: master, action: noop }
  default: { environment: dev, namespace: dev }
"#;

    #[test]
    fn test_parse_sample() {
        let pipeline = PipelineParser::parse(SAMPLE).unwrap();

        assert_eq!(pipeline.name.as_deref(), Some("toolkit"));
        assert_eq!(pipeline.jobs.len(), 3);
        assert_eq!(pipeline.jobs[1].requires, vec!["build-image".to_string()]);
        assert!(!pipeline.jobs[2].runs_on_branch("feature-x"));

        let deploy = pipeline.deploy.as_ref().unwrap();
        assert_eq!(deploy.placeholder, "IMAGE_TAG");
        assert_eq!(deploy.routes[1].action, RouteAction::Noop);
        assert_eq!(deploy.default.namespace, "dev");

        assert!(PipelineValidator::validate(&pipeline).is_ok());
    }

    #[test]
    fn test_yaml_error_has_location() {
        let err = PipelineParser::parse("jobs:\n  - name: a\n    steps: [\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::YamlSyntax);
        assert!(err.line > 0);
    }

    #[test]
    fn test_unknown_step_action() {
        let err = PipelineParser::parse("jobs:\n  - name: a\n    steps:\n      - shout: hi\n")
            .unwrap_err();
        assert!(err.suggestion.unwrap_or_default().contains("restore_cache"));
    }

    #[test]
    fn test_validate_unknown_and_duplicate() {
        let yaml = r#"
jobs:
  - name: a
    requires: [missing]
    steps: [{ run: "true" }]
  - name: a
    steps: [{ run: "true" }]
"#;
        let pipeline = PipelineParser::parse(yaml).unwrap();
        let errors = PipelineValidator::validate(&pipeline).unwrap_err();

        assert!(errors.iter().any(|e| e.message.contains("unknown job 'missing'")));
        assert!(errors.iter().any(|e| e.message.contains("duplicate job name")));
    }

    #[test]
    fn test_validate_deploy_without_table() {
        let yaml = "jobs:\n  - name: release\n    steps:\n      - deploy: {}\n";
        let pipeline = PipelineParser::parse(yaml).unwrap();
        let errors = PipelineValidator::validate(&pipeline).unwrap_err();
        assert!(errors[0].message.contains("no 'deploy:' table"));
    }

    #[test]
    fn test_validate_publish_credentials() {
        let yaml = "jobs:\n  - name: p\n    steps:\n      - publish: { image: x, credentials: [ONLY_ONE] }\n";
        let pipeline = PipelineParser::parse(yaml).unwrap();
        assert!(PipelineValidator::validate(&pipeline).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = PipelineParser::load("/nonexistent/conveyor.yaml").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::IoError);
    }
}
