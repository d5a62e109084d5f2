use maestro_core::{MaestroError, MaestroResult};
use regex::Regex;

/// Maps a free-text request to the analysis domains it touches.
///
/// Implementations must be deterministic: the same request always yields
/// the same domains in the same order.
pub trait DomainClassifier: Send + Sync {
    /// Matched domains in declaration order. Empty when nothing matched.
    fn classify(&self, request: &str) -> Vec<String>;
}

/// Case-insensitive whole-word keyword matcher.
///
/// Domains are reported in declaration order, not by match position or
/// match count.
pub struct KeywordClassifier {
    domains: Vec<(String, Regex)>,
}

impl KeywordClassifier {
    /// Build from `(domain, keywords)` pairs. A domain without keywords
    /// matches on its own name.
    pub fn new<I>(domains: I) -> MaestroResult<Self>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut compiled = Vec::new();
        for (name, keywords) in domains {
            if name.trim().is_empty() {
                return Err(MaestroError::Config("domain name must not be empty".into()));
            }
            if compiled.iter().any(|(existing, _)| existing == &name) {
                return Err(MaestroError::Config(format!("duplicate domain '{name}'")));
            }
            let words: Vec<String> = if keywords.is_empty() {
                vec![whole_word(&name)]
            } else {
                keywords
                    .iter()
                    .map(|k| k.trim())
                    .filter(|k| !k.is_empty())
                    .map(whole_word)
                    .collect()
            };
            if words.is_empty() {
                return Err(MaestroError::Config(format!(
                    "domain '{name}' has only blank keywords"
                )));
            }
            let pattern = format!("(?i){}", words.join("|"));
            let regex = Regex::new(&pattern).map_err(|e| {
                MaestroError::Config(format!("invalid keywords for domain '{name}': {e}"))
            })?;
            compiled.push((name, regex));
        }
        Ok(Self { domains: compiled })
    }

    /// Domains in declaration order.
    pub fn domain_names(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(|(name, _)| name.as_str())
    }
}

// `\b` only holds next to word characters, so keywords like "c++" get no
// boundary on their symbol side.
fn whole_word(keyword: &str) -> String {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let start = if keyword.starts_with(is_word) { r"\b" } else { "" };
    let end = if keyword.ends_with(is_word) { r"\b" } else { "" };
    format!("{start}{}{end}", regex::escape(keyword))
}

impl DomainClassifier for KeywordClassifier {
    fn classify(&self, request: &str) -> Vec<String> {
        self.domains
            .iter()
            .filter(|(_, regex)| regex.is_match(request))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
