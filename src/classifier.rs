//! User-agent classification.
//!
//! The engine only needs to know whether a UA is a bot, an AI agent, or a
//! crawler. [`SignatureClassifier`] is a substring matcher over well-known
//! agent tokens; swap in any [`UaClassifier`] for something smarter.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UaClassification {
    pub is_bot: bool,
    pub is_ai: bool,
    pub is_crawler: bool,
}

pub trait UaClassifier: Send + Sync {
    fn classify(&self, user_agent: &str) -> UaClassification;
}

const AI_SIGNATURES: &[&str] = &[
    "gptbot",
    "chatgpt-user",
    "oai-searchbot",
    "claudebot",
    "claude-web",
    "anthropic-ai",
    "perplexitybot",
    "google-extended",
    "ccbot",
    "bytespider",
    "cohere-ai",
    "meta-externalagent",
    "amazonbot",
    "diffbot",
];

const CRAWLER_SIGNATURES: &[&str] = &[
    "crawl",
    "spider",
    "slurp",
    "googlebot",
    "bingbot",
    "duckduckbot",
    "baiduspider",
    "yandexbot",
];

const BOT_SIGNATURES: &[&str] = &[
    "bot",
    "curl/",
    "wget/",
    "python-requests",
    "python-urllib",
    "go-http-client",
    "okhttp",
    "java/",
    "libwww-perl",
    "httpclient",
    "headlesschrome",
    "phantomjs",
    "scrapy",
];

#[derive(Debug, Clone, Default)]
pub struct SignatureClassifier {
    extra_ai: Vec<String>,
    extra_bots: Vec<String>,
}

impl SignatureClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ai_signature(mut self, token: &str) -> Self {
        self.extra_ai.push(token.to_lowercase());
        self
    }

    pub fn with_bot_signature(mut self, token: &str) -> Self {
        self.extra_bots.push(token.to_lowercase());
        self
    }
}

fn matches_any<'a>(ua: &str, tokens: impl IntoIterator<Item = &'a str>) -> bool {
    tokens.into_iter().any(|t| ua.contains(t))
}

impl UaClassifier for SignatureClassifier {
    fn classify(&self, user_agent: &str) -> UaClassification {
        let ua = user_agent.to_lowercase();

        let is_ai = matches_any(&ua, AI_SIGNATURES.iter().copied())
            || matches_any(&ua, self.extra_ai.iter().map(String::as_str));
        let is_crawler = matches_any(&ua, CRAWLER_SIGNATURES.iter().copied());
        let is_bot = is_ai
            || is_crawler
            || matches_any(&ua, BOT_SIGNATURES.iter().copied())
            || matches_any(&ua, self.extra_bots.iter().map(String::as_str));

        UaClassification {
            is_bot,
            is_ai,
            is_crawler,
        }
    }
}
