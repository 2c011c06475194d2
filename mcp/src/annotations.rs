//! Tool annotations and write-access classification.
//!
//! A tool is write-access when its MCP annotations say so. Servers that do
//! not annotate their tools can tag the description instead (`[write]`
//! prefix, or the phrase "write access").

use rmcp::model::{Tool, ToolAnnotations as RmcpToolAnnotations};
use serde::{Deserialize, Serialize};

const WRITE_TAG: &str = "[write]";
const WRITE_PHRASES: [&str; 2] = ["write access", "write-access"];

/// Tool behavior hints with conservative defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAnnotations {
    pub read_only: bool,
    pub destructive: bool,
    pub idempotent: bool,
    pub open_world: bool,
}

impl ToolAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert from rmcp's optional annotations with conservative defaults.
    pub fn from_rmcp(rmcp: &RmcpToolAnnotations) -> Self {
        Self {
            read_only: rmcp.read_only_hint.unwrap_or(false),
            destructive: rmcp.destructive_hint.unwrap_or(true),
            idempotent: rmcp.idempotent_hint.unwrap_or(false),
            open_world: rmcp.open_world_hint.unwrap_or(true),
        }
    }

    #[must_use]
    pub fn with_read_only(mut self, v: bool) -> Self {
        self.read_only = v;
        self
    }

    #[must_use]
    pub fn with_destructive(mut self, v: bool) -> Self {
        self.destructive = v;
        self
    }

    #[must_use]
    pub fn mutates_state(&self) -> bool {
        self.destructive && !self.read_only
    }
}

/// Access level a tool needs from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Read,
    Write,
}

impl AccessLevel {
    /// Classify a tool from its annotations, falling back to its description.
    pub fn of(tool: &Tool) -> Self {
        if let Some(hints) = tool.annotations.as_ref() {
            if hints.read_only_hint.is_some() || hints.destructive_hint.is_some() {
                return if ToolAnnotations::from_rmcp(hints).mutates_state() {
                    AccessLevel::Write
                } else {
                    AccessLevel::Read
                };
            }
        }

        match tool.description.as_deref() {
            Some(description) if description_marks_write(description) => AccessLevel::Write,
            _ => AccessLevel::Read,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, AccessLevel::Write)
    }
}

fn description_marks_write(description: &str) -> bool {
    let lowered = description.trim_start().to_ascii_lowercase();
    lowered.starts_with(WRITE_TAG) || WRITE_PHRASES.iter().any(|p| lowered.contains(p))
}

#[cfg(test)]
mod tests {
    use std::{borrow::Cow, sync::Arc};

    use super::*;

    fn tool(description: Option<&str>, annotations: Option<RmcpToolAnnotations>) -> Tool {
        Tool {
            name: Cow::Borrowed("t"),
            title: None,
            description: description.map(|d| Cow::Owned(d.to_string())),
            input_schema: Arc::new(serde_json::Map::new()),
            output_schema: None,
            annotations,
            icons: None,
        }
    }

    fn hints(read_only: Option<bool>, destructive: Option<bool>) -> RmcpToolAnnotations {
        RmcpToolAnnotations {
            title: None,
            read_only_hint: read_only,
            destructive_hint: destructive,
            idempotent_hint: None,
            open_world_hint: None,
        }
    }

    #[test]
    fn test_conservative_defaults() {
        let ann = ToolAnnotations::from_rmcp(&hints(None, None));
        assert!(!ann.read_only);
        assert!(ann.destructive);
        assert!(!ann.idempotent);
        assert!(ann.open_world);
    }

    #[test]
    fn test_explicit_hints_decide() {
        let read = tool(Some("[write] ignored"), Some(hints(Some(true), None)));
        assert_eq!(AccessLevel::of(&read), AccessLevel::Read);

        let write = tool(Some("lists things"), Some(hints(None, Some(true))));
        assert_eq!(AccessLevel::of(&write), AccessLevel::Write);

        let harmless = tool(None, Some(hints(Some(false), Some(false))));
        assert_eq!(AccessLevel::of(&harmless), AccessLevel::Read);
    }

    #[test]
    fn test_description_markers() {
        assert!(AccessLevel::of(&tool(Some("[WRITE] Create an issue"), None)).is_write());
        assert!(AccessLevel::of(&tool(Some("Requires write access to the repo"), None)).is_write());
        assert!(AccessLevel::of(&tool(Some("Write-access: delete a file"), None)).is_write());
        assert!(!AccessLevel::of(&tool(Some("Search issues"), None)).is_write());
        assert!(!AccessLevel::of(&tool(None, None)).is_write());
    }

    #[test]
    fn test_annotations_without_hints_fall_back_to_description() {
        let t = tool(Some("[write] push"), Some(hints(None, None)));
        assert!(AccessLevel::of(&t).is_write());
    }
}
