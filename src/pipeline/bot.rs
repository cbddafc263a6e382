//! Bot detection (spec 4.1: "conceptually a sub-predicate of 7-10 depending
//! on tenant config"). Inspects `User-Agent` against a known-bot baseline
//! plus any configured substrings.

use hyper::HeaderMap;

use crate::config::BotPolicy;

/// Baseline substrings recognized regardless of configuration, matched
/// case-insensitively against `User-Agent`.
const BASELINE_BOT_SUBSTRINGS: &[&str] = &[
    "bot", "spider", "crawl", "slurp", "bingpreview", "facebookexternalhit", "pingdom", "uptimerobot",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotDecision {
    NotABot,
    /// Policy says reject outright: terminal 403.
    Reject,
    /// Policy says allow only static/non-dynamic terminals; dynamic
    /// terminals (tenant proxy, reverse-proxy routes) must reject instead.
    StaticOnly,
}

pub fn classify(
    enabled: bool,
    policy: BotPolicy,
    extra_substrings: &[String],
    user_agent: Option<&str>,
) -> BotDecision {
    if !enabled {
        return BotDecision::NotABot;
    }
    let Some(ua) = user_agent else {
        return BotDecision::NotABot;
    };
    let ua_lower = ua.to_ascii_lowercase();
    let is_bot = BASELINE_BOT_SUBSTRINGS.iter().any(|needle| ua_lower.contains(needle))
        || extra_substrings.iter().any(|needle| ua_lower.contains(&needle.to_ascii_lowercase()));

    if !is_bot {
        return BotDecision::NotABot;
    }

    match policy {
        BotPolicy::Reject => BotDecision::Reject,
        BotPolicy::StaticOnly => BotDecision::StaticOnly,
        BotPolicy::Ignore => BotDecision::NotABot,
    }
}

pub fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(hyper::header::USER_AGENT).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_detection_never_flags() {
        let decision = classify(false, BotPolicy::Reject, &[], Some("Googlebot/2.1"));
        assert_eq!(decision, BotDecision::NotABot);
    }

    #[test]
    fn baseline_substring_rejected_under_reject_policy() {
        let decision = classify(true, BotPolicy::Reject, &[], Some("Mozilla/5.0 Googlebot/2.1"));
        assert_eq!(decision, BotDecision::Reject);
    }

    #[test]
    fn static_only_policy_allows_static_terminals() {
        let decision = classify(true, BotPolicy::StaticOnly, &[], Some("spider-thing/1.0"));
        assert_eq!(decision, BotDecision::StaticOnly);
    }

    #[test]
    fn ignore_policy_never_flags_even_if_matched() {
        let decision = classify(true, BotPolicy::Ignore, &[], Some("Googlebot/2.1"));
        assert_eq!(decision, BotDecision::NotABot);
    }

    #[test]
    fn extra_substrings_are_matched_case_insensitively() {
        let decision = classify(true, BotPolicy::Reject, &["mycustomscraper".to_string()], Some("MyCustomScraper/9"));
        assert_eq!(decision, BotDecision::Reject);
    }

    #[test]
    fn non_bot_user_agent_passes() {
        let decision = classify(true, BotPolicy::Reject, &[], Some("Mozilla/5.0 (Macintosh)"));
        assert_eq!(decision, BotDecision::NotABot);
    }
}
