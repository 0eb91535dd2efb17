// Pipeline definition errors
// Line/column diagnostics for YAML problems and path-addressed semantic errors

use std::fmt;

/// Parse error with source location and an optional fix hint
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// Excerpt of the source around the error
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Wrong types or missing fields
    InvalidSchema,
    /// File could not be read
    IoError,
    /// Semantic validation failed
    ValidationError,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(message, 0, 0).with_kind(ParseErrorKind::IoError)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach the lines surrounding the error, marking the failing line
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let marker = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", marker, line_num, line));

            if line_num == self.line && self.column > 0 {
                context.push_str(&format!("       | {}^\n", " ".repeat(self.column - 1)));
            }
        }

        self.context = context;
        self
    }

    /// Build from a serde_yaml error, keeping its location
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));

        let mut parsed = ParseError::new(format_yaml_message(err), line, column)
            .with_kind(ParseErrorKind::YamlSyntax)
            .with_source_context(source, 2);
        parsed.suggestion = suggest_fix(err, source, line);
        parsed
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        if self.line > 0 {
            writeln!(f, "  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

fn format_yaml_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();

    if let Some(field) = between(&msg, "missing field `", "`") {
        return format!("missing required field '{}'", field);
    }

    if let Some(field) = between(&msg, "unknown field `", "`") {
        return format!("unknown field '{}'", field);
    }

    if msg.contains("did not match any variant of untagged enum StepAction") {
        return "step has no recognised action".to_string();
    }

    msg
}

fn between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn suggest_fix(err: &serde_yaml::Error, source: &str, line: usize) -> Option<String> {
    let msg = err.to_string();
    let error_line = source.lines().nth(line.saturating_sub(1)).unwrap_or("");

    if msg.contains("untagged enum StepAction") {
        return Some(
            "each step needs exactly one of: run, restore_cache, save_cache, store_artifacts, publish, deploy"
                .to_string(),
        );
    }

    if msg.contains("missing field `name`") {
        return Some("every job needs a unique 'name:'".to_string());
    }

    if error_line.starts_with('\t') {
        return Some("YAML does not allow tabs for indentation. Use spaces.".to_string());
    }

    let typos = [
        ("depends_on", "requires"),
        ("dependencies", "requires"),
        ("continue_on_error", "on_failure: continue"),
        ("condition", "gate"),
        ("branch:", "branches: { only: [...] }"),
    ];

    let lower = error_line.to_lowercase();
    typos
        .iter()
        .find(|(typo, _)| lower.contains(typo))
        .map(|(_, correct)| format!("did you mean '{}'?", correct))
}

/// Result type for parser operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Semantic validation problem, addressed by a path like `jobs[2].steps[0]`
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
    pub path: String,
    pub suggestion: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: path.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation error at '{}': {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("missing required field 'steps'", 4, 5)
            .with_suggestion("add 'steps:' to the job");

        let output = err.to_string();
        assert!(output.contains("missing required field"));
        assert!(output.contains("line 4:5"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_io_error_has_no_location() {
        let err = ParseError::io("failed to read file: not found");
        assert_eq!(err.kind, ParseErrorKind::IoError);
        assert!(!err.to_string().contains("-->"));
    }

    #[test]
    fn test_source_context_marks_line() {
        let source = "name: demo\njobs:\n  - name: build\n    stepz: []";
        let err = ParseError::new("unknown field 'stepz'", 4, 5).with_source_context(source, 1);

        assert!(err.context.contains(">    4 |     stepz: []"));
        assert!(err.context.contains("name: build"));
        assert!(err.context.contains("^"));
    }

    #[test]
    fn test_between() {
        assert_eq!(
            between("missing field `steps` at line 3", "missing field `", "`"),
            Some("steps".to_string())
        );
        assert_eq!(between("nothing here", "missing field `", "`"), None);
    }
}
