//! Recipient sanitising.
//!
//! Numbers are stored and sent in E.164 form. Input that cannot be reduced
//! to a plausible E.164 number is rejected, and the caller drops the send.
//! Bare 10/11-digit numbers are assumed to be NANP (US) numbers.

/// Normalise `input` to E.164, or `None` if it does not look like a number.
pub fn normalize(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let has_plus = input.starts_with('+');
    let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
    let stripped: String = input
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    if has_plus {
        // Everything after the '+' must be digits once separators are gone.
        if stripped[1..].chars().all(|c| c.is_ascii_digit())
            && (8..=15).contains(&digits.len())
        {
            return Some(format!("+{}", digits));
        }
        return None;
    }

    if !stripped.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match digits.len() {
        10 => Some(format!("+1{}", digits)),
        11 if digits.starts_with('1') => Some(format!("+{}", digits)),
        _ => None,
    }
}

/// Render an E.164 number for display.
///
/// NANP numbers come out as `(415) 800-8000`; other 12-digit numbers get
/// spaced groups; anything else is shown as stored.
pub fn printable(number: &str) -> String {
    let rest = match number.strip_prefix('+') {
        Some(rest) => rest,
        None => return number.to_string(),
    };
    if !rest.chars().all(|c| c.is_ascii_digit()) {
        return number.to_string();
    }

    let bytes = rest.as_bytes();
    if bytes.len() == 11 && bytes[0] == b'1' && (b'2'..=b'9').contains(&bytes[1]) {
        return format!("({}) {}-{}", &rest[1..4], &rest[4..7], &rest[7..]);
    }
    if bytes.len() == 12 {
        return format!("+{} {} {} {}", &rest[..2], &rest[2..5], &rest[5..8], &rest[8..]);
    }
    number.to_string()
}
