//! Request validation at the trust boundary.
//!
//! The engine runs privileged, the UI does not. Every inbound request is
//! treated as potentially hostile and passes through this validator before
//! any handler sees it: command whitelist first, then recursive structural
//! limits over the argument tree, then screening of path-like strings, then
//! command-specific checks. Only arguments that pass validation are
//! sanitized (whitespace-trimmed) and handed to the dispatcher.
//!
//! The validator is total: any input yields either acceptance or a specific
//! [`ValidationError`]; it never panics and performs no I/O (path checks
//! are purely lexical).

use omnis_core::command::{Command, ErrorCode};
use omnis_core::message::{Envelope, MessageType};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Patterns that make a path-like string an immediate rejection: parent
/// traversal, home expansion, and shell metacharacters.
const DANGEROUS_PATTERNS: &[&str] = &["..", "~", "$", "`", "|", ";", "&", ">", "<"];

/// Structural ceilings applied recursively to request arguments.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorLimits {
    /// Maximum length of any string value (and any map key).
    pub max_string_len: usize,
    /// Maximum number of entries in any array or map.
    pub max_collection_len: usize,
    /// Maximum nesting depth of the argument tree.
    pub max_depth: usize,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            max_string_len: 4096,
            max_collection_len: 1024,
            max_depth: 16,
        }
    }
}

/// A specific reason a request was refused before reaching handler logic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// The message is not a request at all.
    #[error("expected a request message, got a {0}")]
    NotARequest(&'static str),

    /// The request payload carries no command.
    #[error("request has no command")]
    MissingCommand,

    /// The command is outside the fixed whitelist. This is a security
    /// rejection, not merely "unknown".
    #[error("command '{0}' is not permitted")]
    CommandNotAllowed(String),

    /// A string value exceeds the configured maximum.
    #[error("string of {len} characters exceeds the {max} character limit")]
    StringTooLong { len: usize, max: usize },

    /// An array or map exceeds the configured entry count.
    #[error("collection of {len} entries exceeds the {max} entry limit")]
    CollectionTooLarge { len: usize, max: usize },

    /// The argument tree nests deeper than allowed.
    #[error("arguments nest deeper than {max} levels")]
    TooDeep { max: usize },

    /// A path-like value contains a forbidden pattern.
    #[error("value contains forbidden pattern '{pattern}'")]
    DangerousPattern { pattern: &'static str },

    /// A path must be absolute to be considered at all.
    #[error("path '{0}' is not absolute")]
    NotAbsolute(String),

    /// A syntactically clean path resolves outside every allowed root.
    #[error("path '{0}' is outside the allowed filesystem roots")]
    OutsideAllowedRoots(String),

    /// A command-specific required argument is absent or mistyped.
    #[error("missing or invalid argument '{0}'")]
    MissingArgument(&'static str),

    /// VALIDATE_CONFIG requires its config payload to be a map.
    #[error("config payload must be a map")]
    ConfigNotAMap,
}

impl ValidationError {
    /// The wire error code this rejection reports as.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ValidationError::NotARequest(_) | ValidationError::MissingCommand => {
                ErrorCode::InvalidMessage
            }
            ValidationError::CommandNotAllowed(_) | ValidationError::DangerousPattern { .. } => {
                ErrorCode::PermissionDenied
            }
            ValidationError::NotAbsolute(_) | ValidationError::OutsideAllowedRoots(_) => {
                ErrorCode::InvalidTarget
            }
            ValidationError::StringTooLong { .. }
            | ValidationError::CollectionTooLarge { .. }
            | ValidationError::TooDeep { .. }
            | ValidationError::MissingArgument(_)
            | ValidationError::ConfigNotAMap => ErrorCode::ValidationFailed,
        }
    }
}

/// Whitelist and structural validator for inbound requests.
#[derive(Debug, Clone)]
pub struct SecurityValidator {
    limits: ValidatorLimits,
    allowed_roots: Vec<PathBuf>,
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new(
            ValidatorLimits::default(),
            vec![
                PathBuf::from("/mnt/target"),
                PathBuf::from("/tmp/omnis"),
                PathBuf::from("/run/omnis"),
            ],
        )
    }
}

impl SecurityValidator {
    pub fn new(limits: ValidatorLimits, allowed_roots: Vec<PathBuf>) -> Self {
        Self {
            limits,
            allowed_roots,
        }
    }

    /// Validate one request envelope end to end.
    ///
    /// Returns the whitelisted [`Command`] on success so the caller never
    /// re-parses the command string.
    pub fn validate_request(&self, envelope: &Envelope) -> Result<Command, ValidationError> {
        match envelope.kind {
            MessageType::Request => {}
            MessageType::Response => return Err(ValidationError::NotARequest("response")),
            MessageType::Event => return Err(ValidationError::NotARequest("event")),
        }

        let name = envelope.command().ok_or(ValidationError::MissingCommand)?;
        if name.is_empty() {
            return Err(ValidationError::MissingCommand);
        }
        let command: Command = name
            .parse()
            .map_err(|_| ValidationError::CommandNotAllowed(name.to_string()))?;

        let args = envelope.args();
        self.check_value(&args, 0)?;
        self.check_command_args(command, &args)?;
        Ok(command)
    }

    fn check_command_args(&self, command: Command, args: &Value) -> Result<(), ValidationError> {
        match command {
            Command::StartInstallation => {
                let target = args
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or(ValidationError::MissingArgument("target"))?;
                self.validate_path(target)?;
                Ok(())
            }
            Command::ValidateConfig => {
                match args.get("config") {
                    Some(Value::Object(_)) => Ok(()),
                    _ => Err(ValidationError::ConfigNotAMap),
                }
            }
            _ => Ok(()),
        }
    }

    fn check_value(&self, value: &Value, depth: usize) -> Result<(), ValidationError> {
        if depth > self.limits.max_depth {
            return Err(ValidationError::TooDeep {
                max: self.limits.max_depth,
            });
        }
        match value {
            Value::String(s) => self.check_string(s),
            Value::Array(items) => {
                if items.len() > self.limits.max_collection_len {
                    return Err(ValidationError::CollectionTooLarge {
                        len: items.len(),
                        max: self.limits.max_collection_len,
                    });
                }
                for item in items {
                    self.check_value(item, depth + 1)?;
                }
                Ok(())
            }
            Value::Object(map) => {
                if map.len() > self.limits.max_collection_len {
                    return Err(ValidationError::CollectionTooLarge {
                        len: map.len(),
                        max: self.limits.max_collection_len,
                    });
                }
                for (key, item) in map {
                    self.check_string(key)?;
                    self.check_value(item, depth + 1)?;
                }
                Ok(())
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
        }
    }

    fn check_string(&self, s: &str) -> Result<(), ValidationError> {
        if s.len() > self.limits.max_string_len {
            return Err(ValidationError::StringTooLong {
                len: s.len(),
                max: self.limits.max_string_len,
            });
        }
        // Only strings that look like paths are screened; ordinary text may
        // legitimately contain '&' or '$'.
        if s.contains('/') || s.contains('\\') {
            scan_dangerous(s)?;
        }
        Ok(())
    }

    /// Validate a filesystem path destined for privileged use.
    ///
    /// The string must be free of dangerous patterns, absolute, and — after
    /// lexical normalization — a descendant of one of the allowed roots.
    /// No filesystem access is performed.
    pub fn validate_path(&self, path: &str) -> Result<PathBuf, ValidationError> {
        scan_dangerous(path)?;

        if !path.starts_with('/') {
            return Err(ValidationError::NotAbsolute(path.to_string()));
        }

        let mut resolved = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir => resolved.push("/"),
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                // ".." is already rejected by the pattern scan; refuse it
                // here as well so normalization can never climb.
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(ValidationError::DangerousPattern { pattern: ".." });
                }
            }
        }

        if self
            .allowed_roots
            .iter()
            .any(|root| resolved.starts_with(root))
        {
            Ok(resolved)
        } else {
            Err(ValidationError::OutsideAllowedRoots(path.to_string()))
        }
    }

    /// Trim incidental whitespace from every string leaf.
    ///
    /// Runs only after validation passes; it is a tidy-up, never a defense.
    pub fn sanitize(&self, args: &Value) -> Value {
        match args {
            Value::String(s) => Value::String(s.trim().to_string()),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.sanitize(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn scan_dangerous(s: &str) -> Result<(), ValidationError> {
    for pattern in DANGEROUS_PATTERNS {
        if s.contains(pattern) {
            return Err(ValidationError::DangerousPattern { pattern });
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> SecurityValidator {
        SecurityValidator::default()
    }

    fn request(command: &str, args: Value) -> Envelope {
        let mut env = Envelope::request(Command::Ping, args);
        env.payload["command"] = Value::String(command.to_string());
        env
    }

    #[test]
    fn test_whitelisted_command_accepted() {
        let env = request("PING", json!({ "echo": "hi" }));
        assert_eq!(validator().validate_request(&env).unwrap(), Command::Ping);
    }

    #[test]
    fn test_unlisted_command_is_security_rejection() {
        let env = request("FORMAT_DISK", json!({}));
        let err = validator().validate_request(&env).unwrap_err();
        assert!(matches!(err, ValidationError::CommandNotAllowed(_)));
        assert_eq!(err.error_code(), ErrorCode::PermissionDenied);
    }

    #[test]
    fn test_non_request_rejected() {
        let env = Envelope::event(omnis_core::EventKind::EngineReady, Value::Null);
        let err = validator().validate_request(&env).unwrap_err();
        assert!(matches!(err, ValidationError::NotARequest("event")));
    }

    #[test]
    fn test_string_length_boundary() {
        let v = validator();
        let max = v.limits.max_string_len;

        let under = request("PING", json!({ "echo": "a".repeat(max) }));
        v.validate_request(&under).unwrap();

        let over = request("PING", json!({ "echo": "a".repeat(max + 1) }));
        let err = v.validate_request(&over).unwrap_err();
        assert!(matches!(err, ValidationError::StringTooLong { .. }));
        assert_eq!(err.error_code(), ErrorCode::ValidationFailed);
    }

    #[test]
    fn test_nesting_depth_boundary() {
        let v = validator();
        let max = v.limits.max_depth;

        // Nested maps: args itself is depth 0, each wrapper adds one level.
        let build = |levels: usize| {
            let mut value = json!("leaf");
            for _ in 0..levels {
                value = json!({ "inner": value });
            }
            request("PING", value)
        };

        v.validate_request(&build(max)).unwrap();
        let err = v.validate_request(&build(max + 1)).unwrap_err();
        assert!(matches!(err, ValidationError::TooDeep { .. }));
    }

    #[test]
    fn test_collection_size_boundary() {
        let v = validator();
        let max = v.limits.max_collection_len;

        let under: Vec<u32> = (0..max as u32).collect();
        v.validate_request(&request("PING", json!({ "items": under })))
            .unwrap();

        let over: Vec<u32> = (0..=max as u32).collect();
        let err = v
            .validate_request(&request("PING", json!({ "items": over })))
            .unwrap_err();
        assert!(matches!(err, ValidationError::CollectionTooLarge { .. }));
    }

    #[test]
    fn test_path_like_arg_with_shell_metacharacters_rejected() {
        let env = request("PING", json!({ "note": "/mnt/target; rm -rf /" }));
        let err = validator().validate_request(&env).unwrap_err();
        assert!(matches!(err, ValidationError::DangerousPattern { .. }));
        assert_eq!(err.error_code(), ErrorCode::PermissionDenied);
    }

    #[test]
    fn test_plain_text_with_metacharacters_allowed() {
        // No slash, so it is not path-like; '$' and '&' are fine in prose.
        let env = request("PING", json!({ "note": "cost: $5 & rising" }));
        validator().validate_request(&env).unwrap();
    }

    #[test]
    fn test_validate_path_traversal_rejected() {
        let err = validator().validate_path("../../etc/passwd").unwrap_err();
        assert!(matches!(
            err,
            ValidationError::DangerousPattern { pattern: ".." }
        ));
    }

    #[test]
    fn test_validate_path_outside_roots_rejected() {
        let err = validator().validate_path("/etc/passwd").unwrap_err();
        assert!(matches!(err, ValidationError::OutsideAllowedRoots(_)));
        assert_eq!(err.error_code(), ErrorCode::InvalidTarget);
    }

    #[test]
    fn test_validate_path_shell_injection_rejected() {
        let err = validator()
            .validate_path("/mnt/target; rm -rf /")
            .unwrap_err();
        assert!(matches!(err, ValidationError::DangerousPattern { .. }));
    }

    #[test]
    fn test_validate_path_home_expansion_rejected() {
        let err = validator().validate_path("~/target").unwrap_err();
        assert!(matches!(
            err,
            ValidationError::DangerousPattern { pattern: "~" }
        ));
    }

    #[test]
    fn test_validate_path_relative_rejected() {
        let err = validator().validate_path("mnt/target").unwrap_err();
        assert!(matches!(err, ValidationError::NotAbsolute(_)));
    }

    #[test]
    fn test_validate_path_under_allowed_root_accepted() {
        let path = validator().validate_path("/mnt/target/boot").unwrap();
        assert!(path.is_absolute());
        assert!(path.starts_with("/mnt"));
        assert_eq!(path, PathBuf::from("/mnt/target/boot"));
    }

    #[test]
    fn test_validate_path_normalizes_current_dir() {
        let path = validator().validate_path("/mnt/target/./boot").unwrap();
        assert_eq!(path, PathBuf::from("/mnt/target/boot"));
    }

    #[test]
    fn test_start_installation_requires_valid_target() {
        let v = validator();
        let missing = request("START_INSTALLATION", json!({}));
        assert!(matches!(
            v.validate_request(&missing).unwrap_err(),
            ValidationError::MissingArgument("target")
        ));

        let bad = request("START_INSTALLATION", json!({ "target": "/etc" }));
        assert!(matches!(
            v.validate_request(&bad).unwrap_err(),
            ValidationError::OutsideAllowedRoots(_)
        ));

        let good = request("START_INSTALLATION", json!({ "target": "/mnt/target" }));
        assert_eq!(
            v.validate_request(&good).unwrap(),
            Command::StartInstallation
        );
    }

    #[test]
    fn test_validate_config_requires_map() {
        let v = validator();
        let scalar = request("VALIDATE_CONFIG", json!({ "config": "de_DE.UTF-8" }));
        assert!(matches!(
            v.validate_request(&scalar).unwrap_err(),
            ValidationError::ConfigNotAMap
        ));

        let list = request("VALIDATE_CONFIG", json!({ "config": ["a", "b"] }));
        assert!(matches!(
            v.validate_request(&list).unwrap_err(),
            ValidationError::ConfigNotAMap
        ));

        let map = request("VALIDATE_CONFIG", json!({ "config": { "locale": "de_DE" } }));
        v.validate_request(&map).unwrap();
    }

    #[test]
    fn test_sanitize_trims_string_leaves() {
        let v = validator();
        let args = json!({
            "locale": "  de_DE.UTF-8  ",
            "nested": { "user": "\talice\n" },
            "list": ["  x ", 7, true],
        });
        let clean = v.sanitize(&args);
        assert_eq!(clean["locale"], "de_DE.UTF-8");
        assert_eq!(clean["nested"]["user"], "alice");
        assert_eq!(clean["list"][0], "x");
        assert_eq!(clean["list"][1], 7);
    }
}
