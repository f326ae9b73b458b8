use std::collections::HashMap;

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Rule {
    allow: bool,
    pattern: String,
}

#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
}

/// Parsed robots.txt rules for one host.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    groups: Vec<Group>,
}

impl RobotsRules {
    /// Rules that allow everything (missing or unreachable robots.txt).
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse robots.txt text. Unknown directives are ignored.
    pub fn parse(txt: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current: Option<Group> = None;
        let mut last_was_agent = false;

        for raw in txt.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            let Some((field, value)) = line.split_once(':') else { continue };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    // Consecutive user-agent lines share one group.
                    if !last_was_agent {
                        if let Some(g) = current.take() {
                            groups.push(g);
                        }
                        current = Some(Group::default());
                    }
                    if let Some(g) = current.as_mut() {
                        g.agents.push(value.to_ascii_lowercase());
                    }
                    last_was_agent = true;
                }
                "allow" | "disallow" => {
                    last_was_agent = false;
                    let Some(g) = current.as_mut() else { continue };
                    // An empty Disallow allows everything.
                    if value.is_empty() {
                        continue;
                    }
                    g.rules.push(Rule { allow: field == "allow", pattern: value.to_string() });
                }
                _ => last_was_agent = false,
            }
        }
        if let Some(g) = current {
            groups.push(g);
        }
        Self { groups }
    }

    /// Whether `path` may be fetched by `user_agent`.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let Some(group) = self.group_for(user_agent) else { return true };

        let mut best: Option<(usize, bool)> = None;
        for rule in &group.rules {
            if !pattern_matches(&rule.pattern, path) {
                continue;
            }
            let len = rule.pattern.len();
            best = match best {
                Some((l, allow)) if l > len || (l == len && allow) => Some((l, allow)),
                _ => Some((len, rule.allow)),
            };
        }
        best.map(|(_, allow)| allow).unwrap_or(true)
    }

    fn group_for(&self, user_agent: &str) -> Option<&Group> {
        let ua = user_agent.to_ascii_lowercase();
        let specific = self
            .groups
            .iter()
            .flat_map(|g| g.agents.iter().map(move |a| (a, g)))
            .filter(|(a, _)| a.as_str() != "*" && ua.contains(a.as_str()))
            .max_by_key(|(a, _)| a.len())
            .map(|(_, g)| g);
        specific.or_else(|| self.groups.iter().find(|g| g.agents.iter().any(|a| a == "*")))
    }
}

/// robots.txt path matching with `*` wildcards and a trailing `$` anchor.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            if !path.starts_with(part) {
                return false;
            }
            pos = part.len();
            continue;
        }
        match path[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }
    if anchored {
        // The last literal segment must end the path.
        let last = parts.last().copied().unwrap_or("");
        return if parts.len() == 1 { path.len() == pattern.len() } else { path.ends_with(last) };
    }
    true
}

/// Per-host cache of parsed robots.txt rules.
#[derive(Default)]
pub struct RobotsCache {
    entries: Mutex<HashMap<String, RobotsRules>>,
}

impl RobotsCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached rules for `host`, if fetched before.
    pub async fn get(&self, host: &str) -> Option<RobotsRules> {
        self.entries.lock().await.get(host).cloned()
    }

    /// Store rules for `host`.
    pub async fn insert(&self, host: &str, rules: RobotsRules) {
        self.entries.lock().await.insert(host.to_string(), rules);
    }

    /// Number of hosts cached.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no host has been cached yet.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
# sample
User-agent: *
Disallow: /private/
Disallow: /search
Allow: /private/open

User-agent: BadBot
User-agent: WorseBot
Disallow: /

User-agent: Googlebot
Disallow: /*.pdf$
";

    #[test]
    fn wildcard_group_applies_to_unknown_agents() {
        let r = RobotsRules::parse(ROBOTS);
        let ua = "Mozilla/5.0 (X11; Linux x86_64)";
        assert!(r.is_allowed(ua, "/race/tour-de-france/2024"));
        assert!(!r.is_allowed(ua, "/private/stats"));
        assert!(!r.is_allowed(ua, "/search?q=x"));
        assert!(r.is_allowed(ua, "/private/open/page"));
    }

    #[test]
    fn named_groups_take_precedence() {
        let r = RobotsRules::parse(ROBOTS);
        assert!(!r.is_allowed("WorseBot/1.0", "/race"));
        assert!(!r.is_allowed("Googlebot", "/files/report.pdf"));
        assert!(r.is_allowed("Googlebot", "/files/report.pdf.html"));
        assert!(r.is_allowed("Googlebot", "/private/stats"));
    }

    #[test]
    fn empty_rules_allow_everything() {
        assert!(RobotsRules::allow_all().is_allowed("any", "/x"));
        let r = RobotsRules::parse("User-agent: *\nDisallow:\n");
        assert!(r.is_allowed("any", "/anything"));
    }
}
