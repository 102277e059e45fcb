//! Caller identity → retrieval budget.
//!
//! Identification is best-effort: callers announce themselves through MCP
//! `clientInfo.name` or an HTTP header, and nothing stops a client from
//! sending a misleading label. The table only picks a sensible budget; it is
//! never used for access control.

use std::time::Duration;

use serde::Serialize;

/// Identity used when a caller did not announce itself.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Upstream maximum for a single list page.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Timeout and page-count budget for one class of caller.
///
/// `soft_timeout_ms < hard_timeout_ms`: retrieval stops at the soft threshold,
/// leaving headroom to serialize and return before the caller's own hard
/// timeout fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientProfile {
    pub name: String,
    pub hard_timeout_ms: u64,
    pub soft_timeout_ms: u64,
    pub max_pages: u32,
    pub page_size: u32,
}

impl ClientProfile {
    pub fn new(
        name: impl Into<String>,
        hard_timeout_ms: u64,
        soft_timeout_ms: u64,
        max_pages: u32,
        page_size: u32,
    ) -> Self {
        let hard_timeout_ms = hard_timeout_ms.max(2);
        Self {
            name: name.into(),
            hard_timeout_ms,
            soft_timeout_ms: soft_timeout_ms.clamp(1, hard_timeout_ms - 1),
            max_pages: max_pages.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    /// Same budget restricted to a single page of `page_size` records.
    pub fn single_page(&self, page_size: u32) -> Self {
        Self {
            max_pages: 1,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            ..self.clone()
        }
    }

    fn apply(&mut self, overrides: &BudgetOverrides) {
        if let Some(max_pages) = overrides.max_pages {
            self.max_pages = self.max_pages.min(max_pages.max(1));
        }
        if let Some(soft_timeout_ms) = overrides.soft_timeout_ms {
            self.soft_timeout_ms = self.soft_timeout_ms.min(soft_timeout_ms.max(1));
        }
    }
}

/// Operator caps applied on top of the built-in table. Caps only ever tighten
/// a profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetOverrides {
    pub max_pages: Option<u32>,
    pub soft_timeout_ms: Option<u64>,
}

impl BudgetOverrides {
    pub fn is_empty(&self) -> bool {
        self.max_pages.is_none() && self.soft_timeout_ms.is_none()
    }
}

/// One row of the registry: any pattern matching the identity selects `profile`.
#[derive(Debug, Clone)]
pub struct ProfileRule {
    pub patterns: Vec<String>,
    pub profile: ClientProfile,
}

impl ProfileRule {
    pub fn new(patterns: &[&str], profile: ClientProfile) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_ascii_lowercase()).collect(),
            profile,
        }
    }

    fn matches(&self, identity: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| identity.contains(pattern.as_str()))
    }
}

/// Ordered `(patterns, profile)` table. First match wins, so more specific
/// patterns must come first (`claude-code` before `claude`).
#[derive(Debug, Clone)]
pub struct ClientBudgetRegistry {
    rules: Vec<ProfileRule>,
    fallback: ClientProfile,
}

impl ClientBudgetRegistry {
    /// Builds a registry whose fallback is tightened to be no more permissive
    /// than any rule on every budget axis.
    pub fn new(rules: Vec<ProfileRule>, fallback: ClientProfile) -> Self {
        let mut fallback = fallback;
        for rule in &rules {
            let p = &rule.profile;
            fallback.hard_timeout_ms = fallback.hard_timeout_ms.min(p.hard_timeout_ms);
            fallback.soft_timeout_ms = fallback.soft_timeout_ms.min(p.soft_timeout_ms);
            fallback.max_pages = fallback.max_pages.min(p.max_pages);
            fallback.page_size = fallback.page_size.min(p.page_size);
        }
        if fallback.soft_timeout_ms >= fallback.hard_timeout_ms {
            fallback.soft_timeout_ms = fallback.hard_timeout_ms.saturating_sub(1).max(1);
        }
        Self { rules, fallback }
    }

    pub fn builtin() -> Self {
        Self::new(
            vec![
                ProfileRule::new(
                    &["claude-code", "claude code"],
                    ClientProfile::new("claude_code", 300_000, 240_000, 100, MAX_PAGE_SIZE),
                ),
                ProfileRule::new(
                    &["claude"],
                    ClientProfile::new("claude", 120_000, 90_000, 50, MAX_PAGE_SIZE),
                ),
                ProfileRule::new(
                    &["cursor"],
                    ClientProfile::new("cursor", 60_000, 45_000, 25, MAX_PAGE_SIZE),
                ),
                ProfileRule::new(
                    &["n8n"],
                    ClientProfile::new("n8n", 60_000, 40_000, 20, MAX_PAGE_SIZE),
                ),
                ProfileRule::new(
                    &["openai", "chatgpt"],
                    ClientProfile::new("openai", 45_000, 30_000, 10, MAX_PAGE_SIZE),
                ),
                ProfileRule::new(
                    &["make.com", "integromat", "zapier", "pipedream"],
                    ClientProfile::new("automation", 30_000, 20_000, 5, MAX_PAGE_SIZE),
                ),
            ],
            ClientProfile::new("conservative", 20_000, 15_000, 3, MAX_PAGE_SIZE),
        )
    }

    /// Applies operator caps to every rule and to the fallback.
    pub fn with_overrides(mut self, overrides: BudgetOverrides) -> Self {
        if overrides.is_empty() {
            return self;
        }
        for rule in &mut self.rules {
            rule.profile.apply(&overrides);
        }
        self.fallback.apply(&overrides);
        self
    }

    /// Resolves a caller identity. Absent, blank and unmatched identities all
    /// get the most conservative profile.
    pub fn resolve(&self, identity: Option<&str>) -> ClientProfile {
        let Some(identity) = identity
            .map(|raw| raw.trim().to_ascii_lowercase())
            .filter(|raw| !raw.is_empty() && raw != UNKNOWN_CLIENT)
        else {
            return self.fallback.clone();
        };
        self.rules
            .iter()
            .find(|rule| rule.matches(&identity))
            .map(|rule| rule.profile.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn most_conservative(&self) -> &ClientProfile {
        &self.fallback
    }

    pub fn rules(&self) -> &[ProfileRule] {
        &self.rules
    }
}

impl Default for ClientBudgetRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
