//! Rules module for Sift
//!
//! Block-rule storage and evaluation, shared between the control surface
//! and the fast-path workers. Reads vastly outnumber writes, so each rule
//! family sits behind its own read/write lock and the hot-path check takes
//! shared locks in a fixed order: ip, port, app, domain.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use aho_corasick::AhoCorasick;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocols::AppType;
use crate::utils::{ipv4_to_string, parse_ipv4};

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("failed to access rule file: {0}")]
    Io(#[from] std::io::Error),
}

/// Which rule family triggered a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Ip,
    Port,
    App,
    Domain,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::Ip => write!(f, "ip"),
            RuleKind::Port => write!(f, "port"),
            RuleKind::App => write!(f, "app"),
            RuleKind::Domain => write!(f, "domain"),
        }
    }
}

/// The first rule that matched a packet.
#[derive(Debug, Clone)]
pub struct BlockReason {
    pub kind: RuleKind,
    pub detail: String,
    pub timestamp: Instant,
}

/// Rule counts and hot-path counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleStats {
    pub blocked_ips: usize,
    pub blocked_ports: usize,
    pub blocked_apps: usize,
    pub blocked_domains: usize,
    pub total_block_checks: u64,
    pub total_blocks_triggered: u64,
}

/// Exact domain names plus substring/wildcard patterns. The substring
/// patterns are compiled into one Aho-Corasick automaton, rebuilt on
/// every (rare) write.
#[derive(Default)]
struct DomainRules {
    exact: HashSet<String>,
    patterns: Vec<String>,
    matcher: Option<AhoCorasick>,
}

impl DomainRules {
    fn rebuild_matcher(&mut self) {
        let substrings: Vec<&String> = self
            .patterns
            .iter()
            .filter(|p| !p.starts_with("*."))
            .collect();
        self.matcher = if substrings.is_empty() {
            None
        } else {
            AhoCorasick::new(&substrings).ok()
        };
    }

    fn matches_pattern(&self, name: &str) -> Option<&str> {
        if let Some(matcher) = &self.matcher {
            if let Some(found) = matcher.find(name) {
                return self
                    .patterns
                    .iter()
                    .filter(|p| !p.starts_with("*."))
                    .nth(found.pattern().as_usize())
                    .map(String::as_str);
            }
        }

        self.patterns
            .iter()
            .filter(|p| p.starts_with("*."))
            .find(|p| {
                let suffix: &str = &p[1..]; // ".example.com"
                name.ends_with(suffix) || name == &p[2..]
            })
            .map(String::as_str)
    }
}

/// Shared block-rule store.
pub struct RuleManager {
    blocked_ips: RwLock<HashSet<u32>>,
    blocked_ports: RwLock<HashSet<u16>>,
    blocked_apps: RwLock<HashSet<AppType>>,
    domains: RwLock<DomainRules>,

    strict_domain_matching: AtomicBool,
    total_block_checks: AtomicU64,
    total_blocks_triggered: AtomicU64,
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleManager {
    pub fn new() -> RuleManager {
        RuleManager {
            blocked_ips: RwLock::new(HashSet::new()),
            blocked_ports: RwLock::new(HashSet::new()),
            blocked_apps: RwLock::new(HashSet::new()),
            domains: RwLock::new(DomainRules::default()),
            strict_domain_matching: AtomicBool::new(false),
            total_block_checks: AtomicU64::new(0),
            total_blocks_triggered: AtomicU64::new(0),
        }
    }

    pub fn block_ip(&self, ip: u32) {
        self.blocked_ips.write().insert(ip);
        info!("Blocked source IP {}", ipv4_to_string(ip));
    }

    pub fn unblock_ip(&self, ip: u32) {
        self.blocked_ips.write().remove(&ip);
    }

    pub fn is_ip_blocked(&self, ip: u32) -> bool {
        self.blocked_ips.read().contains(&ip)
    }

    pub fn block_port(&self, port: u16) {
        self.blocked_ports.write().insert(port);
        info!("Blocked destination port {}", port);
    }

    pub fn unblock_port(&self, port: u16) {
        self.blocked_ports.write().remove(&port);
    }

    pub fn is_port_blocked(&self, port: u16) -> bool {
        self.blocked_ports.read().contains(&port)
    }

    pub fn block_app(&self, app: AppType) {
        self.blocked_apps.write().insert(app);
        info!("Blocked application {}", app);
    }

    pub fn unblock_app(&self, app: AppType) {
        self.blocked_apps.write().remove(&app);
    }

    pub fn is_app_blocked(&self, app: AppType) -> bool {
        self.blocked_apps.read().contains(&app)
    }

    pub fn block_domain(&self, domain: &str) {
        let domain: String = domain.to_ascii_lowercase();
        let mut domains = self.domains.write();
        if !domain.starts_with("*.") {
            domains.exact.insert(domain.clone());
        }
        if !domains.patterns.contains(&domain) {
            domains.patterns.push(domain.clone());
        }
        domains.rebuild_matcher();
        info!("Blocked domain {}", domain);
    }

    pub fn unblock_domain(&self, domain: &str) {
        let domain: String = domain.to_ascii_lowercase();
        let mut domains = self.domains.write();
        domains.exact.remove(&domain);
        domains.patterns.retain(|p| p != &domain);
        domains.rebuild_matcher();
    }

    pub fn is_domain_blocked(&self, name: &str) -> bool {
        let name: String = name.to_ascii_lowercase();
        let domains = self.domains.read();
        if domains.exact.contains(&name) {
            return true;
        }
        if self.strict_domain_matching.load(Ordering::Relaxed) {
            return false;
        }
        domains.matches_pattern(&name).is_some()
    }

    /// When strict, only exact domain-set membership blocks; otherwise the
    /// pattern list is consulted too.
    pub fn set_strict_domain_matching(&self, enabled: bool) {
        self.strict_domain_matching.store(enabled, Ordering::Relaxed);
    }

    pub fn is_strict_domain_matching(&self) -> bool {
        self.strict_domain_matching.load(Ordering::Relaxed)
    }

    /// Evaluate the rule families in fixed order against one packet's
    /// attributes. Returns the first match.
    pub fn should_block(
        &self,
        src_ip: u32,
        dst_port: u16,
        app: AppType,
        domain: &str,
    ) -> Option<BlockReason> {
        self.total_block_checks.fetch_add(1, Ordering::Relaxed);

        let reason: Option<BlockReason> = self.match_rules(src_ip, dst_port, app, domain);
        if let Some(reason) = &reason {
            self.total_blocks_triggered.fetch_add(1, Ordering::Relaxed);
            debug!("Rule hit: {} {}", reason.kind, reason.detail);
        }
        reason
    }

    fn match_rules(
        &self,
        src_ip: u32,
        dst_port: u16,
        app: AppType,
        domain: &str,
    ) -> Option<BlockReason> {
        if self.blocked_ips.read().contains(&src_ip) {
            return Some(BlockReason {
                kind: RuleKind::Ip,
                detail: ipv4_to_string(src_ip),
                timestamp: Instant::now(),
            });
        }

        if self.blocked_ports.read().contains(&dst_port) {
            return Some(BlockReason {
                kind: RuleKind::Port,
                detail: dst_port.to_string(),
                timestamp: Instant::now(),
            });
        }

        if self.blocked_apps.read().contains(&app) {
            return Some(BlockReason {
                kind: RuleKind::App,
                detail: app.to_string(),
                timestamp: Instant::now(),
            });
        }

        if !domain.is_empty() && self.is_domain_blocked(domain) {
            return Some(BlockReason {
                kind: RuleKind::Domain,
                detail: domain.to_string(),
                timestamp: Instant::now(),
            });
        }

        None
    }

    /// Save every rule as newline-delimited `KIND value` records.
    pub fn save_rules<P: AsRef<Path>>(&self, path: P) -> Result<(), RuleError> {
        let mut out = String::from("# sift block rules\n");

        let mut ips: Vec<u32> = self.blocked_ips.read().iter().copied().collect();
        ips.sort_unstable();
        for ip in ips {
            out.push_str(&format!("IP {}\n", ipv4_to_string(ip)));
        }

        let mut ports: Vec<u16> = self.blocked_ports.read().iter().copied().collect();
        ports.sort_unstable();
        for port in ports {
            out.push_str(&format!("PORT {}\n", port));
        }

        let mut apps: Vec<AppType> = self.blocked_apps.read().iter().copied().collect();
        apps.sort();
        for app in apps {
            out.push_str(&format!("APP {}\n", app));
        }

        {
            let domains = self.domains.read();
            let mut names: Vec<&String> = domains.patterns.iter().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("DOMAIN {}\n", name));
            }
        }

        fs::write(path.as_ref(), out)?;
        Ok(())
    }

    /// Load rules from the text format, skipping comments, blanks, and
    /// unknown lines. Returns the number of rules applied.
    pub fn load_rules<P: AsRef<Path>>(&self, path: P) -> Result<usize, RuleError> {
        let content: String = fs::read_to_string(path.as_ref())?;
        let mut count: usize = 0;

        for line in content.lines() {
            let line: &str = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((kind, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let value: &str = value.trim();

            match kind {
                "IP" => match parse_ipv4(value) {
                    Some(ip) => {
                        self.block_ip(ip);
                        count += 1;
                    }
                    None => warn!("Skipping rule with invalid IP: {}", value),
                },
                "PORT" => match value.parse::<u16>() {
                    Ok(port) => {
                        self.block_port(port);
                        count += 1;
                    }
                    Err(_) => warn!("Skipping rule with invalid port: {}", value),
                },
                "APP" => match AppType::from_app_name(value) {
                    Some(app) => {
                        self.block_app(app);
                        count += 1;
                    }
                    None => warn!("Skipping rule with unknown app: {}", value),
                },
                "DOMAIN" => {
                    self.block_domain(value);
                    count += 1;
                }
                _ => debug!("Skipping unknown rule line: {}", line),
            }
        }

        info!("Loaded {} rules from {}", count, path.as_ref().display());
        Ok(count)
    }

    /// Drop every rule.
    pub fn clear_all(&self) {
        self.blocked_ips.write().clear();
        self.blocked_ports.write().clear();
        self.blocked_apps.write().clear();
        let mut domains = self.domains.write();
        domains.exact.clear();
        domains.patterns.clear();
        domains.matcher = None;
    }

    pub fn stats(&self) -> RuleStats {
        RuleStats {
            blocked_ips: self.blocked_ips.read().len(),
            blocked_ports: self.blocked_ports.read().len(),
            blocked_apps: self.blocked_apps.read().len(),
            blocked_domains: self.domains.read().patterns.len(),
            total_block_checks: self.total_block_checks.load(Ordering::Relaxed),
            total_blocks_triggered: self.total_blocks_triggered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> u32 {
        parse_ipv4(s).unwrap()
    }

    #[test]
    fn rule_families_match_in_fixed_order() {
        let rules = RuleManager::new();
        rules.block_ip(ip("10.0.0.1"));
        rules.block_port(443);
        rules.block_app(AppType::YouTube);

        // IP outranks port, port outranks app.
        let reason = rules
            .should_block(ip("10.0.0.1"), 443, AppType::YouTube, "")
            .unwrap();
        assert_eq!(reason.kind, RuleKind::Ip);

        let reason = rules
            .should_block(ip("10.0.0.2"), 443, AppType::YouTube, "")
            .unwrap();
        assert_eq!(reason.kind, RuleKind::Port);

        let reason = rules
            .should_block(ip("10.0.0.2"), 80, AppType::YouTube, "")
            .unwrap();
        assert_eq!(reason.kind, RuleKind::App);

        assert!(rules
            .should_block(ip("10.0.0.2"), 80, AppType::Google, "")
            .is_none());

        let stats = rules.stats();
        assert_eq!(stats.total_block_checks, 4);
        assert_eq!(stats.total_blocks_triggered, 3);
    }

    #[test]
    fn domain_substring_matching() {
        let rules = RuleManager::new();
        rules.block_domain("youtube");

        assert!(rules.is_domain_blocked("www.youtube.com"));
        assert!(rules.is_domain_blocked("YOUTUBE"));
        assert!(!rules.is_domain_blocked("example.com"));

        let reason = rules
            .should_block(ip("10.0.0.1"), 443, AppType::Https, "www.youtube.com")
            .unwrap();
        assert_eq!(reason.kind, RuleKind::Domain);
    }

    #[test]
    fn strict_mode_requires_exact_match() {
        let rules = RuleManager::new();
        rules.set_strict_domain_matching(true);
        rules.block_domain("youtube.com");

        assert!(rules.is_domain_blocked("youtube.com"));
        assert!(!rules.is_domain_blocked("www.youtube.com"));

        rules.set_strict_domain_matching(false);
        assert!(rules.is_domain_blocked("www.youtube.com"));
    }

    #[test]
    fn wildcard_patterns_match_subdomains() {
        let rules = RuleManager::new();
        rules.block_domain("*.example.com");

        assert!(rules.is_domain_blocked("cdn.example.com"));
        assert!(rules.is_domain_blocked("example.com"));
        assert!(!rules.is_domain_blocked("example.org"));
        assert!(!rules.is_domain_blocked("badexample.com"));
    }

    #[test]
    fn empty_domain_never_matches() {
        let rules = RuleManager::new();
        rules.block_domain("youtube");
        assert!(rules
            .should_block(ip("10.0.0.1"), 443, AppType::Https, "")
            .is_none());
    }

    #[test]
    fn save_clear_load_round_trip() {
        let rules = RuleManager::new();
        rules.block_ip(ip("192.168.1.50"));
        rules.block_port(8443);
        rules.block_app(AppType::TikTok);
        rules.block_domain("ads.example.com");
        rules.block_domain("*.tracker.net");

        let path = std::env::temp_dir().join(format!("sift-rules-{}.txt", std::process::id()));
        rules.save_rules(&path).unwrap();

        rules.clear_all();
        let empty = rules.stats();
        assert_eq!(empty.blocked_ips + empty.blocked_ports + empty.blocked_apps, 0);
        assert_eq!(empty.blocked_domains, 0);

        let loaded = rules.load_rules(&path).unwrap();
        assert_eq!(loaded, 5);
        assert!(rules.is_ip_blocked(ip("192.168.1.50")));
        assert!(rules.is_port_blocked(8443));
        assert!(rules.is_app_blocked(AppType::TikTok));
        assert!(rules.is_domain_blocked("ads.example.com"));
        assert!(rules.is_domain_blocked("cdn.tracker.net"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn loader_skips_malformed_lines() {
        let path = std::env::temp_dir().join(format!("sift-badrules-{}.txt", std::process::id()));
        std::fs::write(
            &path,
            "# comment\n\nIP 300.1.1.1\nIP 10.0.0.9\nPORT notaport\nAPP NoSuchApp\nBOGUS line\nDOMAIN ok.com\n",
        )
        .unwrap();

        let rules = RuleManager::new();
        let loaded = rules.load_rules(&path).unwrap();
        assert_eq!(loaded, 2);
        assert!(rules.is_ip_blocked(parse_ipv4("10.0.0.9").unwrap()));
        assert!(rules.is_domain_blocked("ok.com"));

        std::fs::remove_file(&path).ok();
    }
}
