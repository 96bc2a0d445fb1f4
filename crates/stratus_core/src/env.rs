use crate::constants::env::PASSTHROUGH;
use crate::error::UsageError;

use tracing::warn;

/// Resolves the environment handed to the job.
///
/// Without explicit requests the well-known variables present in `lookup` are passed
/// through. Any request disables that; `NAME=VALUE` sets a value and a bare `NAME`
/// forwards it from `lookup`.
pub fn resolve_environment<F>(
    requested: &[String],
    lookup: F,
) -> Result<Vec<(String, String)>, UsageError>
where
    F: Fn(&str) -> Option<String>,
{
    if requested.is_empty() {
        return Ok(PASSTHROUGH
            .iter()
            .filter_map(|name| lookup(name).map(|value| (name.to_string(), value)))
            .collect());
    }

    let mut resolved = Vec::with_capacity(requested.len());
    for arg in requested {
        let (name, value) = match arg.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (arg.as_str(), None),
        };

        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(UsageError::Conflict(format!(
                "invalid environment variable '{arg}'"
            )));
        }

        match value.or_else(|| lookup(name)) {
            Some(value) => resolved.push((name.to_string(), value)),
            None => warn!("Environment variable {name} is not set; not passing it to the build"),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn host() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("AWS_ACCESS_KEY_ID", "AKIA"),
            ("GITHUB_TOKEN", "ghp"),
            ("HOME", "/home/me"),
        ])
    }

    fn lookup(name: &str) -> Option<String> {
        host().get(name).map(|v| v.to_string())
    }

    #[test]
    fn well_known_variables_pass_through_by_default() {
        let env = resolve_environment(&[], lookup).unwrap();
        assert_eq!(
            env,
            vec![
                ("AWS_ACCESS_KEY_ID".to_string(), "AKIA".to_string()),
                ("GITHUB_TOKEN".to_string(), "ghp".to_string()),
            ]
        );
    }

    #[test]
    fn explicit_requests_disable_pass_through() {
        let env = resolve_environment(&["FOO=bar".into(), "HOME".into()], lookup).unwrap();
        assert_eq!(
            env,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("HOME".to_string(), "/home/me".to_string()),
            ]
        );
    }

    #[test]
    fn unset_forwarded_variables_are_skipped() {
        let env = resolve_environment(&["MISSING".into()], lookup).unwrap();
        assert!(env.is_empty());
    }

    #[test]
    fn malformed_names_are_usage_errors() {
        assert!(resolve_environment(&["=x".into()], lookup).is_err());
    }
}
