//! Workflow document parsing and filesystem operations.
//!
//! Workflow documents are JSON objects matching `WorkflowDefinition`.
//! `parse_workflow_json` gates on strict validation, so the returned
//! definition is guaranteed runnable; the draft variant returns the
//! definition together with its `{errors, warnings}` report for editors
//! working on incomplete documents.

use std::path::Path;

use ragloom_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::validate::{ValidationIssue, ValidationReport, validate_draft, validate_strict};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from loading or storing workflow documents.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Strict validation failed. Every finding is included.
    #[error("workflow is invalid: {}", issues_summary(.0))]
    Invalid(Vec<ValidationIssue>),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn issues_summary(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a JSON document into a validated `WorkflowDefinition`.
///
/// Runs strict validation after deserialization, so the returned value is
/// guaranteed to be executable.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    let issues = validate_strict(&def);
    if !issues.is_empty() {
        return Err(WorkflowError::Invalid(issues));
    }
    Ok(def)
}

/// Parse a JSON document leniently, returning the parsed definition along
/// with its draft validation report instead of failing on incompleteness.
pub fn parse_workflow_json_draft(
    json: &str,
) -> Result<(WorkflowDefinition, ValidationReport), WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    let report = validate_draft(&def);
    Ok((def, report))
}

/// Serialize a `WorkflowDefinition` to pretty-printed JSON.
pub fn serialize_workflow_json(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_json::to_string_pretty(def).map_err(|e| WorkflowError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load and strictly validate a workflow document from disk.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_json(&content)
}

/// Save a workflow document, creating parent directories as needed.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serialize_workflow_json(def)?;
    std::fs::write(path, json)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "name": "research",
        "inputs": { "query": { "type": "string", "required": true } },
        "steps": [
            { "id": "find", "tool": "search", "inputs": { "query": "{{ inputs.query }}" } },
            { "id": "brief", "tool": "generate", "inputs": { "text": "{{ find.output.hits }}" } }
        ],
        "output": "{{ brief.output }}"
    }"#;

    #[test]
    fn test_parse_valid_document() {
        let def = parse_workflow_json(VALID).unwrap();
        assert_eq!(def.name, "research");
        assert_eq!(def.steps.len(), 2);
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = parse_workflow_json("{ not json").unwrap_err();
        assert!(matches!(err, WorkflowError::Parse(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_tool() {
        let err = parse_workflow_json(
            r#"{ "name": "x", "steps": [ { "id": "a", "tool": "teleport", "inputs": {} } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Parse(_)));
    }

    #[test]
    fn test_parse_collects_all_strict_findings() {
        let err = parse_workflow_json(
            r#"{
                "name": "broken",
                "steps": [
                    { "id": "a", "tool": "query", "inputs": { "x": "{{ ghost.output }}" } },
                    { "id": "a", "tool": "query", "inputs": {} }
                ]
            }"#,
        )
        .unwrap_err();
        match err {
            WorkflowError::Invalid(issues) => {
                assert_eq!(issues.len(), 2);
            }
            other => panic!("expected Invalid, got {other}"),
        }
    }

    #[test]
    fn test_draft_parse_keeps_incomplete_documents() {
        let (def, report) = parse_workflow_json_draft(
            r#"{
                "name": "wip",
                "steps": [ { "id": "a", "tool": "filter", "inputs": {} } ]
            }"#,
        )
        .unwrap();
        assert_eq!(def.steps.len(), 1);
        assert!(report.errors.is_empty());
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/research.json");
        let def = parse_workflow_json(VALID).unwrap();

        save_workflow_file(&path, &def).unwrap();
        let loaded = load_workflow_file(&path).unwrap();
        assert_eq!(loaded.name, def.name);
        assert_eq!(loaded.steps.len(), def.steps.len());
        assert_eq!(loaded.output, def.output);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = load_workflow_file(Path::new("/nonexistent/workflow.json")).unwrap_err();
        assert!(matches!(err, WorkflowError::Io(_)));
    }
}
