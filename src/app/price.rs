//! Price text normalization and the identity-key sanitizer.

use std::sync::LazyLock;

use regex::Regex;

static NUMERIC_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9][0-9.,'\u{00A0}\u{202F} ]*").expect("numeric run pattern is valid")
});

static KEY_STRIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s-]").expect("key strip pattern is valid"));

/// Turns free-form price text into a whole amount.
///
/// Currency symbols, codes and thousands separators are ignored and any
/// fractional part is truncated: `"$1,200"`, `"1.200 €"` and `"1 200,90 Kč"`
/// all yield `1200`. Text without digits (`"Price on request"`) yields `None`.
///
/// Only the first digit run is read, so a leading count or shorthand wins:
/// `"3+kk, 1 200 Kč"` yields `3` and `"1.5k"` yields `1`. Such values fall
/// outside any realistic band and are dropped by the band screen.
pub fn normalize_price(text: &str) -> Option<i64> {
    let run = NUMERIC_RUN.find(text)?.as_str();
    let run = run.trim_end_matches(|c: char| !c.is_ascii_digit());

    let integer_digits = match decimal_mark(run) {
        Some(idx) => &run[..idx],
        None => run,
    };

    let mut amount: i64 = 0;
    for ch in integer_digits.chars().filter(char::is_ascii_digit) {
        let digit = i64::from(ch.to_digit(10)?);
        amount = amount.checked_mul(10)?.checked_add(digit)?;
    }
    Some(amount)
}

/// Byte index of the decimal mark in a numeric run, if it has one.
fn decimal_mark(run: &str) -> Option<usize> {
    let (last_idx, last) = run.char_indices().filter(|(_, c)| !c.is_ascii_digit()).last()?;
    if last != ',' && last != '.' {
        return None;
    }

    let digits_after = run[last_idx + last.len_utf8()..]
        .chars()
        .take_while(char::is_ascii_digit)
        .count();
    let same_kind = run.chars().filter(|c| *c == last).count();
    let other = if last == ',' { '.' } else { ',' };
    let mixed = run.contains(other);

    if mixed {
        // "1,234.56" / "1.234,56": the trailing mark is the decimal one.
        return (same_kind == 1).then_some(last_idx);
    }
    if same_kind > 1 || digits_after == 3 {
        return None;
    }
    Some(last_idx)
}

/// Identity-key form of a title or link: characters outside word, space and
/// hyphen are removed, then the result is trimmed and lowercased.
pub fn sanitize(input: &str) -> String {
    KEY_STRIP.replace_all(input, "").trim().to_lowercase()
}
