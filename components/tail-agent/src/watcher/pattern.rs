// External crates
use regex::Regex;

/// Compiled form of a project's `log_pattern`.
///
/// `*` matches any run of characters (including none); every other character
/// is literal. The pattern is anchored, so `app-*.log` matches `app-1.log` but
/// not `old-app-1.log` or `app-1.log.gz`.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: String,
    regex: Regex,
}

impl PatternMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        let regex = Regex::new(&format!("^{body}$"))?;

        tracing::trace!(
            log_pattern = pattern,
            compiled = %regex,
            "Compiled log file pattern"
        );

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, filename: &str) -> bool {
        self.regex.is_match(filename)
    }

    /// The original glob-style pattern.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_any_run() {
        let m = PatternMatcher::new("logstash-*.json").expect("valid pattern");
        assert!(m.is_match("logstash-2024.01.01.json"));
        assert!(m.is_match("logstash-.json"));
        assert!(!m.is_match("logstash-1.json.gz"));
        assert!(!m.is_match("old-logstash-1.json"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let m = PatternMatcher::new("app(1)+.log").expect("valid pattern");
        assert!(m.is_match("app(1)+.log"));
        assert!(!m.is_match("app1.log"));

        let dot = PatternMatcher::new("a.log").expect("valid pattern");
        assert!(!dot.is_match("axlog"));
    }

    #[test]
    fn multiple_wildcards() {
        let m = PatternMatcher::new("*-*.log").expect("valid pattern");
        assert!(m.is_match("app-1.log"));
        assert!(m.is_match("-.log"));
        assert!(!m.is_match("app.log"));
        assert_eq!(m.as_str(), "*-*.log");
    }
}
