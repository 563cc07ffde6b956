use std::fmt;

/// Versioned key namespace.
///
/// Every persisted key looks like `{namespace}:v{schema}:{kind}:{suffix}`.
/// Bumping the schema version makes all older keys unreachable, which is how
/// incompatible format changes are rolled out without a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
    schema_version: u32,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>, schema_version: u32) -> Self {
        Self {
            namespace: namespace.into(),
            schema_version,
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn key(&self, kind: &str, suffix: &str) -> String {
        format!("{}:v{}:{}:{}", self.namespace, self.schema_version, kind, suffix)
    }

    // Caché de metadata
    pub fn query(&self, normalized: &str) -> String {
        self.key("q", normalized)
    }
    pub fn id(&self, stable_id: &str) -> String {
        self.key("id", stable_id)
    }
    pub fn query_to_id(&self, normalized: &str) -> String {
        self.key("q2id", normalized)
    }
    pub fn aliases(&self, stable_id: &str) -> String {
        self.key("aliases", stable_id)
    }

    // Locks
    pub fn extraction_lock(&self, normalized: &str) -> String {
        self.key("lock", normalized)
    }
    pub fn direct_url_lock(&self, stable_id: &str) -> String {
        self.key("durl_lock", stable_id)
    }

    // Micro-caché de URLs directas
    pub fn direct_url(&self, stable_id: &str) -> String {
        self.key("durl", stable_id)
    }
    pub fn hard_video(&self, stable_id: &str) -> String {
        self.key("hard", stable_id)
    }

    // Salud de cookies
    pub fn cookie(&self, name: &str) -> String {
        self.key("cookie", name)
    }
    pub fn cookie_cooldown(&self, name: &str) -> String {
        self.key("cookie_cooldown", name)
    }
    pub fn cookie_good(&self, name: &str) -> String {
        self.key("cookie_good", name)
    }

    // Telemetría
    pub fn metrics(&self) -> String {
        self.key("metrics", "global")
    }
    pub fn metrics_errors(&self) -> String {
        self.key("metrics_errors", "global")
    }
    pub fn leaderboard_ok(&self) -> String {
        self.key("lb_ok", "cookies")
    }
    pub fn leaderboard_fail(&self) -> String {
        self.key("lb_fail", "cookies")
    }
    pub fn leaderboard_latency(&self) -> String {
        self.key("lb_latency", "cookies")
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("music", 1)
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:v{}", self.namespace, self.schema_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_versioned() {
        let keys = KeySpace::new("music", 3);
        assert_eq!(keys.query("fairuz"), "music:v3:q:fairuz");
        assert_eq!(keys.id("abc123def"), "music:v3:id:abc123def");
        assert_eq!(keys.cookie_cooldown("a.txt"), "music:v3:cookie_cooldown:a.txt");
        assert_eq!(keys.to_string(), "music:v3");
    }

    #[test]
    fn test_schema_bump_changes_every_key() {
        let old = KeySpace::new("music", 1);
        let new = KeySpace::new("music", 2);
        assert_ne!(old.query("x"), new.query("x"));
        assert_ne!(old.metrics(), new.metrics());
        assert_ne!(old.extraction_lock("x"), new.extraction_lock("x"));
    }
}
