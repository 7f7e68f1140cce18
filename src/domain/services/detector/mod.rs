//! Signal detector.
//!
//! Classifies a chat message as signal vs. non-signal in three stages,
//! short-circuiting on rejection:
//!
//! 1. Hard exclusion: status updates, completed-trade notices,
//!    announcements, and personal commentary are dropped outright.
//! 2. Component extraction: named matchers each produce an optional typed
//!    fragment (symbol, direction, entry, targets, stop, leverage).
//! 3. Confidence scoring: a single scorer combines the fragments into a
//!    score and an accept/reject decision.
//!
//! Rejections are values, never panics; the reason string is stable and
//! machine-readable for telemetry.

pub mod patterns;

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::domain::entities::signal::{
    normalize_symbol, EntrySpec, ParsedSignal, Side, SignalType,
};

/// Confidence band assigned by the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

/// An accepted detection.
#[derive(Debug, Clone)]
pub struct SignalDetection {
    pub parsed: ParsedSignal,
    pub score: i32,
    pub confidence: Confidence,
}

/// A rejected message, with the stage that rejected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    TooShort,
    Excluded(&'static str),
    MissingSymbol,
    MissingDirection,
    MissingTradingData,
    BelowConfidence(i32),
}

impl Rejection {
    /// Stable reason code for telemetry.
    pub fn reason(&self) -> String {
        match self {
            Rejection::TooShort => "too_short".to_string(),
            Rejection::Excluded(pattern) => format!("excluded:{}", pattern),
            Rejection::MissingSymbol => "missing_symbol".to_string(),
            Rejection::MissingDirection => "missing_direction".to_string(),
            Rejection::MissingTradingData => "missing_trading_data".to_string(),
            Rejection::BelowConfidence(_) => "below_confidence".to_string(),
        }
    }
}

/// Typed fragments produced by the stage-2 matchers.
#[derive(Debug, Default)]
struct Fragments {
    symbol: Option<String>,
    side: Option<Side>,
    entry: Option<EntrySpec>,
    targets: Vec<Decimal>,
    stop_loss: Option<Decimal>,
    stop_present: bool,
    leverage: Option<Decimal>,
    leverage_present: bool,
    price_tokens: usize,
    type_hint: Option<SignalType>,
}

/// Run the full pipeline over a message.
pub fn detect(text: &str) -> Result<SignalDetection, Rejection> {
    let trimmed = text.trim();
    if trimmed.chars().count() < 10 {
        return Err(Rejection::TooShort);
    }

    if let Some(pattern) = excluded_by(trimmed) {
        return Err(Rejection::Excluded(pattern));
    }

    let fragments = extract(trimmed);
    score(trimmed, fragments)
}

/// Stage 1: hard exclusion. Returns the name of the pattern that fired.
fn excluded_by(text: &str) -> Option<&'static str> {
    for (name, pattern) in patterns::EXCLUSIONS.iter() {
        if pattern.is_match(text) {
            return Some(name);
        }
    }

    // Personal commentary, unless it actually carries trading data.
    if patterns::FIRST_PERSON.is_match(text) && !contains_trading_keywords(text) {
        return Some("first_person");
    }

    None
}

fn contains_trading_keywords(text: &str) -> bool {
    let lower = text.to_lowercase();
    patterns::TRADING_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

/// Parse a price token: strip `$` and separators, drop a trailing dot.
fn parse_price(raw: &str) -> Option<Decimal> {
    let cleaned = raw.trim().trim_start_matches('$').replace(',', "");
    let cleaned = cleaned.trim_end_matches('.');
    if cleaned.is_empty() {
        return None;
    }
    let value = Decimal::from_str(cleaned).ok()?;
    if value <= Decimal::ZERO {
        return None;
    }
    Some(value)
}

/// Stage 2: run every matcher and collect typed fragments.
fn extract(text: &str) -> Fragments {
    let mut fragments = Fragments {
        symbol: extract_symbol(text),
        side: extract_direction(text),
        ..Fragments::default()
    };

    extract_entry(text, &mut fragments);
    extract_targets(text, &mut fragments);
    extract_stop(text, &mut fragments);
    extract_leverage(text, &mut fragments);

    fragments.price_tokens = patterns::PRICE_TOKEN.find_iter(text).count();
    fragments.type_hint = extract_type_hint(text);

    fragments
}

fn extract_symbol(text: &str) -> Option<String> {
    for pattern in patterns::SYMBOLS.iter() {
        if let Some(captures) = pattern.captures(text) {
            if let Some(token) = captures.get(1) {
                if let Some(symbol) = normalize_symbol(token.as_str()) {
                    return Some(symbol);
                }
            }
        }
    }
    None
}

fn extract_direction(text: &str) -> Option<Side> {
    for (direction, pattern) in patterns::DIRECTION_KEYWORDS.iter() {
        if pattern.is_match(text) {
            return Side::parse(direction);
        }
    }
    for pattern in patterns::DIRECTION_LABELED.iter() {
        if let Some(captures) = pattern.captures(text) {
            if let Some(side) = captures.get(1).and_then(|m| Side::parse(m.as_str())) {
                return Some(side);
            }
        }
    }
    for pattern in patterns::DIRECTION_CONTEXT.iter() {
        if let Some(captures) = pattern.captures(text) {
            if let Some(side) = captures.get(1).and_then(|m| Side::parse(m.as_str())) {
                return Some(side);
            }
        }
    }
    for (pattern, direction) in patterns::DIRECTION_EMOJI.iter() {
        if pattern.is_match(text) {
            return Side::parse(direction);
        }
    }
    None
}

fn extract_entry(text: &str, fragments: &mut Fragments) {
    if let Some(captures) = patterns::ENTRY_ZONE.captures(text) {
        let first = captures.get(1).and_then(|m| parse_price(m.as_str()));
        let second = captures.get(2).and_then(|m| parse_price(m.as_str()));
        if let (Some(a), Some(b)) = (first, second) {
            fragments.entry = Some(EntrySpec::zone(a, b));
            return;
        }
    }

    if let Some(captures) = patterns::ENTRY_PAREN.captures(text) {
        let first = captures.get(1).and_then(|m| parse_price(m.as_str()));
        let second = captures.get(2).and_then(|m| parse_price(m.as_str()));
        match (first, second) {
            (Some(a), Some(b)) => {
                fragments.entry = Some(EntrySpec::zone(a, b));
                return;
            }
            (Some(a), None) => {
                fragments.entry = Some(EntrySpec::Single(a));
                return;
            }
            _ => {}
        }
    }

    for pattern in patterns::ENTRY_SINGLE.iter() {
        if let Some(captures) = pattern.captures(text) {
            if let Some(price) = captures.get(1).and_then(|m| parse_price(m.as_str())) {
                fragments.entry = Some(EntrySpec::Single(price));
                return;
            }
        }
    }
}

fn extract_targets(text: &str, fragments: &mut Fragments) {
    // (byte offset, price), deduped by value keeping first occurrence.
    let mut found: Vec<(usize, Decimal)> = Vec::new();
    let mut push = |offset: usize, price: Decimal| {
        if !found.iter().any(|(_, existing)| *existing == price) {
            found.push((offset, price));
        }
    };

    for captures in patterns::TARGET_NUMBERED.captures_iter(text) {
        if let (Some(whole), Some(price)) = (
            captures.get(0),
            captures.get(2).and_then(|m| parse_price(m.as_str())),
        ) {
            push(whole.start(), price);
        }
    }

    for captures in patterns::TARGET_CLAUSE.captures_iter(text) {
        if let Some(rest) = captures.get(1) {
            for token in patterns::PRICE_TOKEN.find_iter(rest.as_str()) {
                if let Some(price) = parse_price(token.as_str()) {
                    push(rest.start() + token.start(), price);
                }
            }
        }
    }

    for captures in patterns::TARGET_LISTED.captures_iter(text) {
        if let (Some(whole), Some(price)) = (
            captures.get(0),
            captures.get(2).and_then(|m| parse_price(m.as_str())),
        ) {
            push(whole.start(), price);
        }
    }

    found.sort_by_key(|(offset, _)| *offset);
    fragments.targets = found.into_iter().map(|(_, price)| price).collect();
}

fn extract_stop(text: &str, fragments: &mut Fragments) {
    // Percent stops count as trading data without an absolute price; the
    // FAST fallback will synthesize one at sizing time. Checked before the
    // price forms so `SL: 3%` is not read as an absolute stop at 3.
    if patterns::STOP_PERCENT.is_match(text) {
        fragments.stop_present = true;
        return;
    }

    for pattern in patterns::STOP_PRICE.iter() {
        if let Some(captures) = pattern.captures(text) {
            if let Some(price) = captures.get(1).and_then(|m| parse_price(m.as_str())) {
                fragments.stop_loss = Some(price);
                fragments.stop_present = true;
                return;
            }
        }
    }

    if patterns::STOP_KEYWORD.iter().any(|p| p.is_match(text)) {
        fragments.stop_present = true;
    }
}

fn extract_leverage(text: &str, fragments: &mut Fragments) {
    for pattern in patterns::LEVERAGE_VALUE.iter() {
        if let Some(captures) = pattern.captures(text) {
            if let Some(value) = captures.get(1).and_then(|m| parse_price(m.as_str())) {
                fragments.leverage = Some(value);
                fragments.leverage_present = true;
                return;
            }
        }
    }
    fragments.leverage_present = patterns::LEVERAGE_HINT.is_match(text);
}

fn extract_type_hint(text: &str) -> Option<SignalType> {
    if patterns::TYPE_SWING.is_match(text) {
        Some(SignalType::Swing)
    } else if patterns::TYPE_DYNAMIC.is_match(text) {
        Some(SignalType::Dynamic)
    } else if patterns::TYPE_FAST.is_match(text) {
        Some(SignalType::Fast)
    } else {
        None
    }
}

/// Stage 3: score the fragments and decide.
fn score(text: &str, fragments: Fragments) -> Result<SignalDetection, Rejection> {
    let symbol = fragments.symbol.ok_or(Rejection::MissingSymbol)?;
    let side = fragments.side.ok_or(Rejection::MissingDirection)?;

    let has_entry = fragments.entry.is_some();
    let has_targets = !fragments.targets.is_empty();
    if !has_entry && !has_targets && !fragments.stop_present {
        return Err(Rejection::MissingTradingData);
    }

    let mut score = 4 + 3; // symbol + direction, both mandatory above
    if has_entry {
        score += 3;
    }
    if has_targets {
        score += 2;
        if fragments.targets.len() >= 2 {
            score += 1;
        }
    }
    if fragments.stop_present {
        score += 2;
    }
    if fragments.leverage_present {
        score += 1;
    }
    if fragments.price_tokens >= 3 {
        score += 1;
    }

    // An exclusion surviving to this stage is still fatal (-10 would sink
    // any score below the accept thresholds).
    if let Some(pattern) = excluded_by(text) {
        return Err(Rejection::Excluded(pattern));
    }

    let confidence = if score >= 8 {
        Confidence::High
    } else if score >= 5 {
        Confidence::Medium
    } else if score >= 3 {
        Confidence::Low
    } else {
        return Err(Rejection::BelowConfidence(score));
    };

    Ok(SignalDetection {
        parsed: ParsedSignal {
            symbol,
            side,
            entry: fragments.entry,
            targets: fragments.targets,
            stop_loss: fragments.stop_loss,
            declared_leverage: fragments.leverage,
            type_hint: fragments.type_hint,
        },
        score,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_full_signal_with_zone_and_targets() {
        let text = "#GUN/USDT LONG Entry zone 0.02350 - 0.02320 \
                    Targets: 0.02375, 0.02400 Stop loss 0.02234";
        let detection = detect(text).unwrap();
        assert_eq!(detection.parsed.symbol, "GUNUSDT");
        assert_eq!(detection.parsed.side, Side::Long);
        assert_eq!(
            detection.parsed.entry,
            Some(EntrySpec::zone(dec!(0.02320), dec!(0.02350)))
        );
        assert_eq!(detection.parsed.entry.as_ref().unwrap().mid(), dec!(0.02335));
        assert_eq!(
            detection.parsed.targets,
            vec![dec!(0.02375), dec!(0.02400)]
        );
        assert_eq!(detection.parsed.stop_loss, Some(dec!(0.02234)));
        assert_eq!(detection.confidence, Confidence::High);
    }

    #[test]
    fn test_setup_signal_without_stop() {
        let text = "#FHE LONG SETUP Target 1: 0.04160 Target 2: 0.04210";
        let detection = detect(text).unwrap();
        assert_eq!(detection.parsed.symbol, "FHEUSDT");
        assert_eq!(detection.parsed.side, Side::Long);
        assert_eq!(detection.parsed.stop_loss, None);
        assert_eq!(
            detection.parsed.targets,
            vec![dec!(0.04160), dec!(0.04210)]
        );
    }

    #[test]
    fn test_status_update_excluded() {
        let result = detect("#PARTI/USDT All entry targets achieved");
        assert!(matches!(result, Err(Rejection::Excluded("targets_achieved"))));
        assert_eq!(
            result.unwrap_err().reason(),
            "excluded:targets_achieved"
        );
    }

    #[test]
    fn test_tp_checkmark_excluded() {
        assert!(matches!(
            detect("BTCUSDT LONG — TP2 ✅ nice one team"),
            Err(Rejection::Excluded("tp_checkmark"))
        ));
    }

    #[test]
    fn test_announcement_excluded() {
        assert!(matches!(
            detect("News: maintenance window tonight for BTC pairs"),
            Err(Rejection::Excluded("announcement"))
        ));
    }

    #[test]
    fn test_too_short_rejected() {
        assert!(matches!(detect("gm"), Err(Rejection::TooShort)));
        assert!(matches!(detect("  BTC   "), Err(Rejection::TooShort)));
    }

    #[test]
    fn test_first_person_without_trading_data_excluded() {
        assert!(matches!(
            detect("I've been thinking about the weather lately, nice day"),
            Err(Rejection::Excluded("first_person"))
        ));
    }

    #[test]
    fn test_first_person_with_trading_data_kept() {
        let text = "I'm opening a trade: #BTC LONG Entry: 60000 SL: 58000 Target 1: 63000";
        let detection = detect(text).unwrap();
        assert_eq!(detection.parsed.symbol, "BTCUSDT");
        assert_eq!(detection.parsed.stop_loss, Some(dec!(58000)));
    }

    #[test]
    fn test_missing_symbol_rejected() {
        assert!(matches!(
            detect("LONG Entry: 0.123 Target 1: 0.130 SL: 0.110"),
            Err(Rejection::MissingSymbol)
        ));
    }

    #[test]
    fn test_missing_direction_rejected() {
        assert!(matches!(
            detect("#BTCUSDT Entry: 60000 Target 1: 62000"),
            Err(Rejection::MissingDirection)
        ));
    }

    #[test]
    fn test_missing_trading_data_rejected() {
        assert!(matches!(
            detect("#BTCUSDT going LONG here friends, what do you think?"),
            Err(Rejection::MissingTradingData)
        ));
    }

    #[test]
    fn test_emoji_direction() {
        let text = "#SOL 🟢 LONG Entry: 145.5 Target 1: 150 SL: 140";
        let detection = detect(text).unwrap();
        assert_eq!(detection.parsed.side, Side::Long);
    }

    #[test]
    fn test_labeled_direction_and_symbol() {
        let text = "Symbol: AVAX Trade Type: Short Entry: 32.5 Target 1: 30 SL: 34";
        let detection = detect(text).unwrap();
        assert_eq!(detection.parsed.symbol, "AVAXUSDT");
        assert_eq!(detection.parsed.side, Side::Short);
    }

    #[test]
    fn test_declared_leverage_extracted() {
        let text = "#OP LONG Entry: 1.85 Leverage: 12.5x Target 1: 1.95 SL: 1.75";
        let detection = detect(text).unwrap();
        assert_eq!(detection.parsed.declared_leverage, Some(dec!(12.5)));
    }

    #[test]
    fn test_percent_stop_counts_as_trading_data() {
        let text = "#DOGE SHORT Entry: 0.155 SL: 3% Target 1: 0.150";
        let detection = detect(text).unwrap();
        assert_eq!(detection.parsed.stop_loss, None);
    }

    #[test]
    fn test_type_hint_keywords() {
        let text = "#LINK swing LONG Entry: 15.5 Target 1: 16.5 SL: 14.8";
        let detection = detect(text).unwrap();
        assert_eq!(detection.parsed.type_hint, Some(SignalType::Swing));
    }

    #[test]
    fn test_listed_targets() {
        let text = "#APT LONG Entry: 9.10 SL: 8.70 1️⃣ 9.40 2) 9.80";
        let detection = detect(text).unwrap();
        assert_eq!(detection.parsed.targets, vec![dec!(9.40), dec!(9.80)]);
    }

    #[test]
    fn test_parse_price_cleanup() {
        assert_eq!(parse_price("$0.024"), Some(dec!(0.024)));
        assert_eq!(parse_price("1,250.5"), Some(dec!(1250.5)));
        assert_eq!(parse_price("0.024."), Some(dec!(0.024)));
        assert_eq!(parse_price("zero"), None);
        assert_eq!(parse_price("0"), None);
    }

    #[test]
    fn test_score_components() {
        // Symbol + direction + entry + 2 targets + stop + >=3 prices
        let text = "#ARB LONG Entry: 1.10 Targets: 1.15, 1.20 SL: 1.05";
        let detection = detect(text).unwrap();
        assert_eq!(detection.score, 4 + 3 + 3 + 2 + 1 + 2 + 1);
        assert_eq!(detection.confidence, Confidence::High);
    }
}
