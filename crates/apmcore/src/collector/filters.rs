//! Ignore patterns and parameter scrubbing (spec §4.3 steps 2 and 6).

use regex::Regex;
use serde_json::Value;

/// One compiled ignore pattern. `IgnoreSet::matches` is O(1) per pattern
/// (no backtracking beyond what `Regex` itself does), keeping the overall
/// filter step O(pattern count) as the collector contract requires.
enum CompiledPattern {
    Exact(String),
    Glob(Regex),
    Regex(Regex),
}

/// Compiled form of `Config::ignored_targets`. A pattern containing `*` is
/// treated as a glob (translated to an anchored regex); a pattern wrapped
/// in `/.../ ` is a raw regex; anything else is an exact match.
pub struct IgnoreSet {
    patterns: Vec<CompiledPattern>,
}

impl IgnoreSet {
    pub fn compile(raw_patterns: &[String]) -> Self {
        let patterns = raw_patterns
            .iter()
            .filter_map(|p| Self::compile_one(p))
            .collect();
        Self { patterns }
    }

    fn compile_one(pattern: &str) -> Option<CompiledPattern> {
        if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            let body = &pattern[1..pattern.len() - 1];
            return Regex::new(body).ok().map(CompiledPattern::Regex);
        }
        if pattern.contains('*') {
            let mut anchored = String::from("^");
            for part in pattern.split('*') {
                anchored.push_str(&regex::escape(part));
                anchored.push_str(".*");
            }
            anchored.truncate(anchored.len() - 2);
            anchored.push('$');
            return Regex::new(&anchored).ok().map(CompiledPattern::Glob);
        }
        Some(CompiledPattern::Exact(pattern.to_string()))
    }

    pub fn matches(&self, target: &str) -> bool {
        self.patterns.iter().any(|p| match p {
            CompiledPattern::Exact(s) => s == target,
            CompiledPattern::Glob(re) | CompiledPattern::Regex(re) => re.is_match(target),
        })
    }
}

/// Pluggable request-parameter scrubber. Pure and side-effect-free, as the
/// collector contract requires — no I/O, no mutation of the input.
pub trait ParamFilter: Send + Sync {
    fn scrub(&self, params: &Value) -> Value;
}

/// Drops values for keys in `denylist` (case-insensitively), recursing into
/// nested objects and arrays. The default filter hosts configure through
/// `additional_filter_parameters`.
pub struct DenylistFilter {
    denylist: Vec<String>,
}

const DEFAULT_DENYLIST: &[&str] = &["password", "password_confirmation", "token", "secret", "authorization"];

impl DenylistFilter {
    pub fn new(additional: &[String]) -> Self {
        let mut denylist: Vec<String> = DEFAULT_DENYLIST.iter().map(|s| s.to_lowercase()).collect();
        denylist.extend(additional.iter().map(|s| s.to_lowercase()));
        Self { denylist }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.denylist.iter().any(|d| key.contains(d.as_str()))
    }

    fn scrub_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        if self.is_sensitive(k) {
                            (k.clone(), Value::String("[FILTERED]".to_string()))
                        } else {
                            (k.clone(), self.scrub_value(v))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.scrub_value(v)).collect()),
            other => other.clone(),
        }
    }
}

impl ParamFilter for DenylistFilter {
    fn scrub(&self, params: &Value) -> Value {
        self.scrub_value(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_pattern_matches_only_itself() {
        let set = IgnoreSet::compile(&["HealthController#show".to_string()]);
        assert!(set.matches("HealthController#show"));
        assert!(!set.matches("HealthController#showX"));
    }

    #[test]
    fn glob_pattern_matches_prefix() {
        let set = IgnoreSet::compile(&["Health*".to_string()]);
        assert!(set.matches("HealthController#show"));
        assert!(!set.matches("UsersController#show"));
    }

    #[test]
    fn regex_pattern_matches() {
        let set = IgnoreSet::compile(&["/^Admin.*#destroy$/".to_string()]);
        assert!(set.matches("AdminUsersController#destroy"));
        assert!(!set.matches("AdminUsersController#show"));
    }

    #[test]
    fn denylist_filter_redacts_nested_keys() {
        let filter = DenylistFilter::new(&["ssn".to_string()]);
        let input = json!({"user": {"password": "hunter2", "ssn": "123", "name": "Ann"}});
        let scrubbed = filter.scrub(&input);
        assert_eq!(scrubbed["user"]["password"], json!("[FILTERED]"));
        assert_eq!(scrubbed["user"]["ssn"], json!("[FILTERED]"));
        assert_eq!(scrubbed["user"]["name"], json!("Ann"));
    }
}
