// Access Policy Table
// Free-tier allow-list of path prefixes; everything else requires premium

use crate::config::AccessConfig;
use crate::model::Tier;

/// Immutable route policy, loaded once at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicyTable {
    free_prefixes: Vec<String>,
}

impl AccessPolicyTable {
    pub fn new<I, S>(free_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let free_prefixes = free_prefixes
            .into_iter()
            .map(Into::into)
            .map(|p: String| normalize(&p).to_string())
            .collect();
        Self { free_prefixes }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(config.free_tier_prefixes.iter().cloned())
    }

    pub fn free_prefixes(&self) -> &[String] {
        &self.free_prefixes
    }

    /// Path with query string and fragment removed
    pub fn strip_query(path: &str) -> &str {
        let end = path.find(['?', '#']).unwrap_or(path.len());
        &path[..end]
    }

    /// Whether `path` falls under a free-tier prefix
    ///
    /// Prefixes match whole segments, so `/addition` covers `/addition/level-2`
    /// but not `/additional`. The root prefix `/` matches only the root itself.
    pub fn is_free(&self, path: &str) -> bool {
        let path = normalize(Self::strip_query(path));
        self.free_prefixes.iter().any(|prefix| {
            if prefix == "/" {
                return path == "/";
            }
            match path.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        })
    }

    pub fn required_tier(&self, path: &str) -> Tier {
        if self.is_free(path) {
            Tier::Basic
        } else {
            Tier::Premium
        }
    }

    /// Tier check; an absent tier is never restricted
    pub fn permits(&self, path: &str, tier: Option<Tier>) -> bool {
        match tier {
            None | Some(Tier::Premium) => true,
            Some(Tier::Basic) => self.is_free(path),
        }
    }
}

impl Default for AccessPolicyTable {
    fn default() -> Self {
        Self::from_config(&AccessConfig::default())
    }
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}
