//! Pattern sets for the signal detector.
//!
//! Each matcher family is a named, declarative list so a rejection or a
//! score contribution can always be traced back to the pattern that
//! produced it.

use once_cell::sync::Lazy;
use regex::Regex;

fn rx(pattern: &str) -> Regex {
    Regex::new(pattern).expect("detector pattern must compile")
}

/// Hard exclusions: status updates, completed-trade notices, announcements.
pub static EXCLUSIONS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "targets_achieved",
            rx(r"(?i)all\s+(?:entry\s+)?targets?\s+achieved"),
        ),
        (
            "tp_targets_achieved",
            rx(r"(?i)all\s+take[- ]?profit\s+targets?\s+achieved"),
        ),
        (
            "targets_achieved_status",
            rx(r"(?i)(?:entry|take[- ]?profit)\s+targets?\s+achieved"),
        ),
        ("target_checkmark", rx(r"(?i)target\s+\d+\s*✅")),
        ("tp_checkmark", rx(r"(?i)tp\d*\s*✅")),
        ("profit_period", rx(r"(?i)profit:\s*[\d.]+%.*period:")),
        ("achieved_emoji", rx(r"(?i)achieved\s*(?:😎|✅|✔)")),
        (
            "announcement",
            rx(r"(?i)^(?:news|update|announcement|important|notice|maintenance)\s*:"),
        ),
        ("system_update", rx(r"(?i)system\s+update|bug\s+fix")),
    ]
});

/// First-person openers are personal commentary unless trading data follows.
pub static FIRST_PERSON: Lazy<Regex> =
    Lazy::new(|| rx(r"(?i)^i\s*(?:['’]\s*(?:ve|m)|\s+am|\s+want|\s+decided|\s+motivated)\b"));

pub const TRADING_KEYWORDS: &[&str] = &[
    "entry", "target", "tp", "stop", "loss", "leverage", "symbol", "trade", "long", "short",
];

/// Symbol matchers. Group 1 captures the base token.
pub static SYMBOLS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        rx(r"#([A-Z]{2,10})(?:USDT|/USDT)?\b"),
        rx(r"\b([A-Z]{2,10})USDT\b"),
        rx(r"\b([A-Z]{2,10})/USDT\b"),
        rx(r"\b([A-Z]{2,10})\(USDT\)"),
        rx(r"(?i)(?:Symbol|COIN NAME|Asset)[:\s]+([A-Za-z]{2,10})(?:USDT|/USDT)?\b"),
    ]
});

/// Standalone direction keywords, checked in order.
pub static DIRECTION_KEYWORDS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("LONG", rx(r"(?i)\bLONG\b")),
        ("SHORT", rx(r"(?i)\bSHORT\b")),
        ("BUY", rx(r"(?i)\bBUY\b")),
        ("SELL", rx(r"(?i)\bSELL\b")),
    ]
});

/// Labeled direction forms: `Trade Type: Long`, `Signal Type - Short`.
pub static DIRECTION_LABELED: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        rx(r"(?i)(?:Trade Type|Signal Type|Type|Direction)\s*[:\-]\s*(Long|Short)"),
        rx(r"(?i)Type\s*-\s*(LONG|SHORT)"),
    ]
});

/// Context forms: `Opening LONG`, `SHORT SETUP`, `#LONG`.
pub static DIRECTION_CONTEXT: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        rx(r"(?i)Opening\s+(LONG|SHORT)"),
        rx(r"(?i)(LONG|SHORT)\s+SETUP"),
        rx(r"(?i)#(LONG|SHORT)\b"),
    ]
});

/// Emoji-paired directions.
pub static DIRECTION_EMOJI: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (rx(r"🔴\s*(?i:SHORT)"), "SHORT"),
        (rx(r"🟢\s*(?i:LONG)"), "LONG"),
        (rx(r"📉\s*(?i:SHORT)"), "SHORT"),
        (rx(r"📈\s*(?i:LONG)"), "LONG"),
    ]
});

/// Entry zone: `Entry zone 0.02350 - 0.02320`, `Buy: 1.23-1.25`,
/// `Entry: (1.23 - 1.25)`.
pub static ENTRY_ZONE: Lazy<Regex> = Lazy::new(|| {
    rx(r"(?i)(?:Entry|Buy|Sell)\s*(?:zone|price|orders?)?\s*[:\-]?\s*\(?\s*\$?([\d.]+)\s*[-–]\s*\$?([\d.]+)\s*\)?")
});

/// Parenthesized entry: `ENTRY PRICE (0.0235 - 0.0232)` or `(0.0235)`.
pub static ENTRY_PAREN: Lazy<Regex> = Lazy::new(|| {
    rx(r"(?i)ENTRY\s+PRICE\s*\(\s*\$?([\d.]+)(?:\s*[-–]\s*\$?([\d.]+))?\s*\)")
});

/// Single entry price labels.
pub static ENTRY_SINGLE: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        rx(r"(?i)Entry\s*(?:zone|Price|Targets?|Orders?)?\s*[:\-]?\s*\$?([\d.]+)"),
        rx(r"(?i)Entries\s*[:\-]?\s*\$?([\d.]+)"),
        rx(r"(?i)\bBuy\b\s*[:\-]?\s*\$?([\d.]+)"),
        rx(r"(?i)\bSell\b\s*[:\-]?\s*\$?([\d.]+)"),
    ]
});

/// Numbered targets: `TP1: 0.024`, `Target 2 - 0.025`.
pub static TARGET_NUMBERED: Lazy<Regex> =
    Lazy::new(|| rx(r"(?i)(?:TP|Target)\s*(\d*)\s*[:\-]?\s*\$?([\d.]+)"));

/// Target list clause: `Targets: 0.02375, 0.02400`. The capture stops at
/// the first character that cannot belong to a price list, so a trailing
/// `Stop loss ...` clause never leaks into the targets.
pub static TARGET_CLAUSE: Lazy<Regex> =
    Lazy::new(|| rx(r"(?i)(?:Targets|Take[- ]?Profits?(?:\s+Targets?)?)\s*[:\-]\s*([$\d.,\s]+)"));

/// Emoji / list numbered targets: `1️⃣ 0.02765`, `2) 0.0288`.
pub static TARGET_LISTED: Lazy<Regex> =
    Lazy::new(|| rx(r"(\d+)\s*(?:\u{fe0f}?\u{20e3}|\))\s*\$?([\d.]+)"));

/// Stop loss with a price.
pub static STOP_PRICE: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        rx(r"(?i)Stop[- ]?Loss\s*(?:price)?\s*[:\-]?\s*\$?([\d.]+)"),
        rx(r"(?i)Stoploss\s*[:\-]?\s*\$?([\d.]+)"),
        rx(r"(?i)\bSL\b\s*[:\-]?\s*\$?([\d.]+)"),
        rx(r"(?i)\bSTOP\b\s*[:\-]?\s*\$?([\d.]+)"),
    ]
});

/// Stop loss given as a percent: `SL: 5%`. Counts as trading data but does
/// not produce an absolute price.
pub static STOP_PERCENT: Lazy<Regex> =
    Lazy::new(|| rx(r"(?i)(?:Stop[- ]?Loss|Stoploss|\bSL\b)\s*[:\-]?\s*[\d.]+\s*%"));

/// Bare stop keywords, presence only.
pub static STOP_KEYWORD: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        rx(r"(?i)Stop[- ]?Loss"),
        rx(r"(?i)Stoploss"),
        rx(r"(?i)\bSL\b"),
        rx(r"(?i)\bSTOP\b"),
        rx(r"(?i)Stop\s+Targets?"),
    ]
});

/// Leverage with a value: `Leverage: 20x`, `10x leverage`.
pub static LEVERAGE_VALUE: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        rx(r"(?i)Leverage\s*[:\-]?\s*(\d+(?:\.\d+)?)\s*x?"),
        rx(r"(?i)(\d+(?:\.\d+)?)\s*x\s*Leverage"),
    ]
});

/// Leverage presence, for scoring.
pub static LEVERAGE_HINT: Lazy<Regex> = Lazy::new(|| rx(r"(?i)Leverage|\bX\d+\b|\b\d+x\b"));

/// Price-like tokens: decimals or large integers.
pub static PRICE_TOKEN: Lazy<Regex> = Lazy::new(|| rx(r"\b\d+\.\d+\b|\b\d{4,}\b"));

/// Explicit signal-type keywords.
pub static TYPE_SWING: Lazy<Regex> = Lazy::new(|| rx(r"(?i)\bswing\b"));
pub static TYPE_DYNAMIC: Lazy<Regex> = Lazy::new(|| rx(r"(?i)\bdynamic\b|\bdynamisk\b"));
pub static TYPE_FAST: Lazy<Regex> = Lazy::new(|| rx(r"(?i)\bfast\b|\bfixed\b"));
