//! Application-layer protocol module for Sift
//!
//! Extractors for the server identity carried by TLS, HTTP, DNS, and QUIC
//! payloads, plus the closed application enumeration flows are classified
//! into. Every extractor is a free function over a bounded payload slice
//! returning the extracted name, or `None` when the payload does not match.

pub mod dns;
pub mod http;
pub mod quic;
pub mod tls;

use std::fmt;

/// Applications and protocols Sift can classify a flow as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AppType {
    Unknown,
    Http,
    Https,
    Dns,
    Tls,
    Quic,
    Google,
    Facebook,
    YouTube,
    Twitter,
    Instagram,
    Netflix,
    Amazon,
    Microsoft,
    Apple,
    WhatsApp,
    Telegram,
    TikTok,
    Spotify,
    Zoom,
    Discord,
    GitHub,
    Cloudflare,
}

/// Built-in table mapping server-name fragments to applications. The first
/// fragment contained in the (lowercased) name wins.
const APP_DOMAINS: &[(&str, AppType)] = &[
    ("youtube", AppType::YouTube),
    ("ytimg", AppType::YouTube),
    ("googlevideo", AppType::YouTube),
    ("google", AppType::Google),
    ("gstatic", AppType::Google),
    ("instagram", AppType::Instagram),
    ("whatsapp", AppType::WhatsApp),
    ("facebook", AppType::Facebook),
    ("fbcdn", AppType::Facebook),
    ("twitter", AppType::Twitter),
    ("twimg", AppType::Twitter),
    ("netflix", AppType::Netflix),
    ("nflxvideo", AppType::Netflix),
    ("amazon", AppType::Amazon),
    ("microsoft", AppType::Microsoft),
    ("windowsupdate", AppType::Microsoft),
    ("apple", AppType::Apple),
    ("icloud", AppType::Apple),
    ("telegram", AppType::Telegram),
    ("tiktok", AppType::TikTok),
    ("spotify", AppType::Spotify),
    ("zoom.us", AppType::Zoom),
    ("discord", AppType::Discord),
    ("github", AppType::GitHub),
    ("cloudflare", AppType::Cloudflare),
];

impl AppType {
    /// Classify a server name (SNI, HTTP Host, or DNS query) by substring
    /// match against the built-in domain table.
    pub fn from_server_name(name: &str) -> AppType {
        let name: String = name.to_ascii_lowercase();
        for (fragment, app) in APP_DOMAINS {
            if name.contains(fragment) {
                return *app;
            }
        }
        AppType::Unknown
    }

    /// Look an application up by its display name, case-insensitively.
    /// Used by the CLI and the rule file loader.
    pub fn from_app_name(name: &str) -> Option<AppType> {
        ALL_APPS
            .iter()
            .copied()
            .find(|app| app.to_string().eq_ignore_ascii_case(name))
    }
}

/// Every classifiable application, for name lookups and report ordering.
pub const ALL_APPS: &[AppType] = &[
    AppType::Unknown,
    AppType::Http,
    AppType::Https,
    AppType::Dns,
    AppType::Tls,
    AppType::Quic,
    AppType::Google,
    AppType::Facebook,
    AppType::YouTube,
    AppType::Twitter,
    AppType::Instagram,
    AppType::Netflix,
    AppType::Amazon,
    AppType::Microsoft,
    AppType::Apple,
    AppType::WhatsApp,
    AppType::Telegram,
    AppType::TikTok,
    AppType::Spotify,
    AppType::Zoom,
    AppType::Discord,
    AppType::GitHub,
    AppType::Cloudflare,
];

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppType::Unknown => write!(f, "Unknown"),
            AppType::Http => write!(f, "HTTP"),
            AppType::Https => write!(f, "HTTPS"),
            AppType::Dns => write!(f, "DNS"),
            AppType::Tls => write!(f, "TLS"),
            AppType::Quic => write!(f, "QUIC"),
            AppType::Google => write!(f, "Google"),
            AppType::Facebook => write!(f, "Facebook"),
            AppType::YouTube => write!(f, "YouTube"),
            AppType::Twitter => write!(f, "Twitter"),
            AppType::Instagram => write!(f, "Instagram"),
            AppType::Netflix => write!(f, "Netflix"),
            AppType::Amazon => write!(f, "Amazon"),
            AppType::Microsoft => write!(f, "Microsoft"),
            AppType::Apple => write!(f, "Apple"),
            AppType::WhatsApp => write!(f, "WhatsApp"),
            AppType::Telegram => write!(f, "Telegram"),
            AppType::TikTok => write!(f, "TikTok"),
            AppType::Spotify => write!(f, "Spotify"),
            AppType::Zoom => write!(f, "Zoom"),
            AppType::Discord => write!(f, "Discord"),
            AppType::GitHub => write!(f, "GitHub"),
            AppType::Cloudflare => write!(f, "Cloudflare"),
        }
    }
}
