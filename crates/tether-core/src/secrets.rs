//! Secret redaction and expression substitution.

use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

/// Replacement written in place of any secret value.
pub const SECRET_MASK: &str = "**************";

fn secret_expression() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\$\{\s*secrets\.getValue\(\s*"([^"]+)"\s*\)\s*\}"#)
            .expect("secret expression pattern is valid")
    })
}

/// Masks every known secret value in text before it reaches a log or a report.
#[derive(Debug, Clone, Default)]
pub struct LogSanitizer {
    // Longest first so that a secret containing another is masked whole.
    secrets: Vec<String>,
}

impl LogSanitizer {
    pub fn new<'a>(secrets: impl IntoIterator<Item = &'a String>) -> Self {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn sanitize(&self, input: &str) -> String {
        let mut output = input.to_string();
        for secret in &self.secrets {
            if output.contains(secret.as_str()) {
                output = output.replace(secret.as_str(), SECRET_MASK);
            }
        }
        output
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

/// Values available to `${secrets.getValue("name")}` expressions in task parameters.
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    secrets: HashMap<String, String>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a decrypted secret, returning the value so it can join the redaction set.
    pub fn insert_secret(&mut self, name: impl Into<String>, value: impl Into<String>) -> String {
        let value = value.into();
        self.secrets.insert(name.into(), value.clone());
        value
    }

    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    /// Merge every secret value into a redaction set.
    pub fn extend_redactions(&self, redactions: &mut BTreeSet<String>) {
        redactions.extend(self.secrets.values().cloned());
    }

    /// Substitute secret expressions. Unknown names are left untouched.
    pub fn substitute(&self, input: &str) -> String {
        secret_expression()
            .replace_all(input, |caps: &regex::Captures| {
                let name = caps.get(1).map_or("", |m| m.as_str());
                match self.secrets.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sanitize_masks_all_occurrences() {
        let secrets = BTreeSet::from(["hunter2".to_string()]);
        let sanitizer = LogSanitizer::new(&secrets);
        assert_eq!(
            sanitizer.sanitize("password=hunter2; again hunter2"),
            format!("password={SECRET_MASK}; again {SECRET_MASK}")
        );
    }

    #[test]
    fn test_sanitize_prefers_longest_secret() {
        let secrets = BTreeSet::from(["abc".to_string(), "abcdef".to_string()]);
        let sanitizer = LogSanitizer::new(&secrets);
        assert_eq!(sanitizer.sanitize("token abcdef"), format!("token {SECRET_MASK}"));
    }

    #[test]
    fn test_blank_secrets_are_ignored() {
        let secrets = BTreeSet::from([String::new(), "  ".to_string()]);
        let sanitizer = LogSanitizer::new(&secrets);
        assert!(sanitizer.is_empty());
        assert_eq!(sanitizer.sanitize("nothing to hide"), "nothing to hide");
    }

    #[test]
    fn test_substitute_known_and_unknown() {
        let mut ctx = ExpressionContext::new();
        ctx.insert_secret("db_password", "s3cr3t");
        let out = ctx.substitute(
            r#"psql -p ${secrets.getValue("db_password")} -u ${secrets.getValue("missing")}"#,
        );
        assert_eq!(out, r#"psql -p s3cr3t -u ${secrets.getValue("missing")}"#);
    }

    #[test]
    fn test_extend_redactions() {
        let mut ctx = ExpressionContext::new();
        ctx.insert_secret("a", "one");
        ctx.insert_secret("b", "two");
        let mut redactions = BTreeSet::from(["zero".to_string()]);
        ctx.extend_redactions(&mut redactions);
        assert_eq!(redactions.len(), 3);
        assert!(redactions.contains("two"));
    }
}
