//! Accept-header parsing and quality scoring.
//!
//! # Responsibilities
//! - Parse `Accept`, `Accept-Language`, `Accept-Encoding` into weighted
//!   preference lists
//! - Score every available representation against every accepted entry and
//!   pick the best
//!
//! # Design Decisions
//! - Default quality is 1; an explicit `q` parameter wins; ties keep parse
//!   order
//! - A wildcard accepted entry matches at its own quality
//! - Language scores an exact variant match one whole point above a
//!   primary-tag match
//! - An option nothing accepts scores -1, so it is only chosen when no
//!   option qualifies at all

/// One parsed entry of an `Accept*` header.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptEntry {
    pub value: String,
    pub quality: f32,
}

/// What kind of representation is being negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationKind {
    Type,
    Language,
    Encoding,
}

/// The selected representation and how well it scored.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub value: String,
    pub score: f32,
}

/// Parse an `Accept*` header value into `{value, quality}` pairs, in
/// appearance order.
pub fn parse_accept(header: &str) -> Vec<AcceptEntry> {
    header
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';');
            let value = parts.next()?.trim();
            if value.is_empty() {
                return None;
            }
            let mut quality = 1.0f32;
            for param in parts {
                let Some((key, val)) = param.split_once('=') else {
                    continue;
                };
                if key.trim().eq_ignore_ascii_case("q") {
                    if let Ok(q) = val.trim().parse::<f32>() {
                        quality = q.clamp(0.0, 1.0);
                    }
                }
            }
            Some(AcceptEntry {
                value: value.to_string(),
                quality,
            })
        })
        .collect()
}

/// Score one available option against one accepted entry; `None` when the
/// entry does not accept the option at all.
fn score_entry(kind: NegotiationKind, available: &str, entry: &AcceptEntry) -> Option<f32> {
    let accepted = entry.value.as_str();

    if accepted == "*" || (kind == NegotiationKind::Type && accepted == "*/*") {
        return Some(entry.quality);
    }
    if accepted.eq_ignore_ascii_case(available) {
        // Exact language variants (sv-SE vs sv-SE) are worth a full extra
        // point over primary-tag matches.
        return Some(match kind {
            NegotiationKind::Language => entry.quality + 1.0,
            _ => entry.quality,
        });
    }
    match kind {
        NegotiationKind::Type => {
            // text/* accepts text/html at the entry's quality.
            if let Some(major) = accepted.strip_suffix("/*") {
                let available_major = available.split('/').next().unwrap_or("");
                if available_major.eq_ignore_ascii_case(major) {
                    return Some(entry.quality);
                }
            }
            None
        }
        NegotiationKind::Language => {
            // "en" accepts "en-US"; "en-US" accepts "en".
            let a_primary = available.split('-').next().unwrap_or(available);
            let e_primary = accepted.split('-').next().unwrap_or(accepted);
            if a_primary.eq_ignore_ascii_case(e_primary) {
                return Some(entry.quality);
            }
            None
        }
        NegotiationKind::Encoding => None,
    }
}

/// Pick the best available option for the client's `Accept*` header.
///
/// A missing header accepts everything at quality 1. Returns `None` only
/// when there are no available options to pick from; an all-unacceptable
/// list still returns the first option, carrying a negative score for the
/// caller to inspect.
pub fn negotiate(
    kind: NegotiationKind,
    accept_header: Option<&str>,
    available: &[String],
) -> Option<Negotiated> {
    if available.is_empty() {
        return None;
    }
    let Some(header) = accept_header else {
        return Some(Negotiated {
            value: available[0].clone(),
            score: 1.0,
        });
    };
    let entries = parse_accept(header);
    if entries.is_empty() {
        return Some(Negotiated {
            value: available[0].clone(),
            score: 1.0,
        });
    }

    let mut best: Option<Negotiated> = None;
    for option in available {
        let score = entries
            .iter()
            .filter_map(|entry| score_entry(kind, option, entry))
            .fold(None::<f32>, |acc, s| {
                Some(acc.map_or(s, |a| if s > a { s } else { a }))
            })
            .unwrap_or(-1.0);
        let better = match &best {
            Some(current) => score > current.score,
            None => true,
        };
        if better {
            best = Some(Negotiated {
                value: option.clone(),
                score,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avail(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn implicit_quality_beats_explicit_lower() {
        let picked = negotiate(
            NegotiationKind::Type,
            Some("text/html;q=0.8, application/json"),
            &avail(&["text/html", "application/json"]),
        )
        .unwrap();
        assert_eq!(picked.value, "application/json");
    }

    #[test]
    fn explicit_quality_wins_over_order() {
        let picked = negotiate(
            NegotiationKind::Type,
            Some("application/json;q=0.2, text/html;q=0.9"),
            &avail(&["application/json", "text/html"]),
        )
        .unwrap();
        assert_eq!(picked.value, "text/html");
    }

    #[test]
    fn tie_keeps_first_available() {
        let picked = negotiate(
            NegotiationKind::Type,
            Some("text/html, application/json"),
            &avail(&["text/html", "application/json"]),
        )
        .unwrap();
        assert_eq!(picked.value, "text/html");
    }

    #[test]
    fn wildcard_matches_at_entry_quality() {
        let picked = negotiate(
            NegotiationKind::Type,
            Some("text/html;q=0.1, */*;q=0.5"),
            &avail(&["application/json", "text/html"]),
        )
        .unwrap();
        assert_eq!(picked.value, "application/json");
        assert!((picked.score - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn major_type_wildcard() {
        let picked = negotiate(
            NegotiationKind::Type,
            Some("text/*"),
            &avail(&["application/json", "text/plain"]),
        )
        .unwrap();
        assert_eq!(picked.value, "text/plain");
    }

    #[test]
    fn exact_language_variant_outscores_primary() {
        let picked = negotiate(
            NegotiationKind::Language,
            Some("sv-SE"),
            &avail(&["sv", "sv-SE"]),
        )
        .unwrap();
        assert_eq!(picked.value, "sv-SE");
        assert!(picked.score > 1.5);
    }

    #[test]
    fn unacceptable_option_scores_negative_but_still_returned() {
        let picked = negotiate(
            NegotiationKind::Encoding,
            Some("br"),
            &avail(&["gzip"]),
        )
        .unwrap();
        assert_eq!(picked.value, "gzip");
        assert!(picked.score < 0.0);
    }

    #[test]
    fn missing_header_accepts_first_available() {
        let picked = negotiate(NegotiationKind::Language, None, &avail(&["en", "sv"])).unwrap();
        assert_eq!(picked.value, "en");
    }

    #[test]
    fn parse_keeps_order_and_qualities() {
        let entries = parse_accept("text/html;q=0.8, application/json");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, "text/html");
        assert!((entries[0].quality - 0.8).abs() < f32::EPSILON);
        assert!((entries[1].quality - 1.0).abs() < f32::EPSILON);
    }
}
