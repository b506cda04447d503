//! Wake phrase matching with a trigger cooldown

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::MatchPolicy;

struct Phrase {
    /// As configured, reported back on a match
    original: String,
    normalized: String,
    tokens: Vec<String>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Finds configured wake phrases in recognized text
pub struct WakePhraseMatcher {
    phrases: Vec<Phrase>,
    policy: MatchPolicy,
}

impl WakePhraseMatcher {
    pub fn new(phrases: &[String], policy: MatchPolicy) -> Self {
        let phrases = phrases
            .iter()
            .filter_map(|p| {
                let tokens = tokenize(p);
                if tokens.is_empty() {
                    return None;
                }
                Some(Phrase {
                    original: p.trim().to_string(),
                    normalized: p.trim().to_lowercase(),
                    tokens,
                })
            })
            .collect();
        Self { phrases, policy }
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// First configured phrase found in `text`
    ///
    /// `Token` requires the phrase's words to appear contiguously as whole
    /// words, ignoring case and surrounding punctuation. `Substring` accepts
    /// the phrase anywhere in the lowercased text.
    pub fn find(&self, text: &str) -> Option<String> {
        let found = match self.policy {
            MatchPolicy::Token => {
                let words = tokenize(text);
                self.phrases.iter().find(|p| {
                    words
                        .windows(p.tokens.len())
                        .any(|window| window == p.tokens.as_slice())
                })
            }
            MatchPolicy::Substring => {
                let lowered = text.to_lowercase();
                self.phrases
                    .iter()
                    .find(|p| lowered.contains(p.normalized.as_str()))
            }
        };
        found.map(|p| p.original.clone())
    }
}

/// Matcher plus a quiet period after each trigger
pub struct WakeDetector {
    matcher: WakePhraseMatcher,
    cooldown: Duration,
    last_trigger: Option<Instant>,
}

impl WakeDetector {
    pub fn new(matcher: WakePhraseMatcher, cooldown: Duration) -> Self {
        Self {
            matcher,
            cooldown,
            last_trigger: None,
        }
    }

    /// Matched phrase, unless still cooling down from the previous trigger
    pub fn check(&mut self, text: &str, now: Instant) -> Option<String> {
        if let Some(last) = self.last_trigger {
            if now.saturating_duration_since(last) < self.cooldown {
                debug!(%text, "wake phrase ignored during cooldown");
                return None;
            }
        }
        let phrase = self.matcher.find(text)?;
        self.last_trigger = Some(now);
        Some(phrase)
    }
}
