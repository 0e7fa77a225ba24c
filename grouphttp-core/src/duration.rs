//! Timeout literals: ISO-8601 durations (`PT5S`, `PT1M30.5S`, `P1DT2H`) or plain milliseconds.

use std::time::Duration;

/// Parse a timeout. Tries ISO-8601 first, then an integer count of milliseconds.
pub fn parse_timeout(s: &str) -> Result<Duration, DurationParseError> {
    let t = s.trim();
    match parse_iso8601(t) {
        Some(d) => Ok(d),
        None => t
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| DurationParseError(s.to_string())),
    }
}

/// `PnDTnHnMn.nS` subset of ISO-8601 (what `java.time.Duration` accepts), non-negative only.
fn parse_iso8601(s: &str) -> Option<Duration> {
    let upper = s.to_ascii_uppercase();
    let rest = upper.strip_prefix('+').unwrap_or(&upper);
    let rest = rest.strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((d, t)) => {
            if t.is_empty() {
                return None;
            }
            (d, Some(t))
        }
        None => (rest, None),
    };

    let mut total = Duration::ZERO;
    let mut any = false;

    if !date.is_empty() {
        let days = date.strip_suffix('D')?;
        let days: u64 = parse_digits(days)?;
        total = total.checked_add(Duration::from_secs(days.checked_mul(86_400)?))?;
        any = true;
    }

    if let Some(mut t) = time {
        for (designator, secs_per_unit) in [('H', 3_600u64), ('M', 60)] {
            if let Some(idx) = t.find(designator) {
                let n: u64 = parse_digits(&t[..idx])?;
                total = total.checked_add(Duration::from_secs(n.checked_mul(secs_per_unit)?))?;
                t = &t[idx + 1..];
                any = true;
            }
        }
        if !t.is_empty() {
            let secs = t.strip_suffix('S')?;
            let (whole, frac) = match secs.split_once(['.', ',']) {
                Some((w, f)) => (w, f),
                None => (secs, ""),
            };
            let whole: u64 = parse_digits(whole)?;
            let nanos = if frac.is_empty() {
                0
            } else {
                if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let padded = format!("{:0<9}", frac);
                padded.parse::<u32>().ok()?
            };
            total = total.checked_add(Duration::new(whole, nanos))?;
            any = true;
        }
    }

    any.then_some(total)
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Timeout literal is neither an ISO-8601 duration nor a millisecond count.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse duration '{0}': expected ISO-8601 (e.g. PT5S) or milliseconds")]
pub struct DurationParseError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_seconds_and_minutes() {
        assert_eq!(parse_timeout("PT5S").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_timeout("pt1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_timeout("PT2H").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_timeout("P1DT1S").unwrap(), Duration::from_secs(86_401));
        assert_eq!(parse_timeout("P2D").unwrap(), Duration::from_secs(172_800));
    }

    #[test]
    fn iso_fractional_seconds() {
        assert_eq!(parse_timeout("PT0.5S").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_timeout("PT1.000000001S").unwrap(), Duration::new(1, 1));
    }

    #[test]
    fn plain_millis() {
        assert_eq!(parse_timeout("2500").unwrap(), Duration::from_millis(2500));
        assert_eq!(parse_timeout(" 0 ").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_invalid() {
        for bad in ["", "P", "PT", "PT5", "5s", "-10", "PT-5S", "PT1.5M", "abc"] {
            assert!(parse_timeout(bad).is_err(), "{}", bad);
        }
    }
}
