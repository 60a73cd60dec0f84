//! Symbol normalization (§6.4) and the `^[A-Z0-9]+-(USDT|USDC)$` contract.

/// The canonical symbol shape: `{BASE}-{QUOTE}` where `QUOTE ∈ {USDT, USDC}`.
static VALID_SUFFIXES: [&str; 2] = ["-USDT", "-USDC"];

/// Normalize an inbound symbol per §6.4. Returns `None` if the result would
/// not match the canonical shape, matching the 400-at-the-boundary
/// behavior described there.
pub fn normalize(raw: &str) -> Option<String> {
    let mut s = raw.to_ascii_uppercase().replace(['/', '\\'], "-");

    // Collapse `(-VST)+` sequences to empty: any run of one or more
    // consecutive `-VST` infixes disappears entirely.
    while let Some(idx) = s.find("-VST") {
        s.replace_range(idx..idx + 4, "");
    }

    // Redundant after the collapse above for the common `-VST-USDT` shape,
    // but kept to mirror the upstream's two explicit rewrite rules.
    s = s.replace("-VST-USDT", "-USDT").replace("-VST-USDC", "-USDC");

    if !VALID_SUFFIXES.iter().any(|suf| s.ends_with(suf)) {
        for suf in ["-USDT", "-USDC", "-VST"] {
            if s.ends_with(suf) {
                s.truncate(s.len() - suf.len());
                break;
            }
        }
        s.push_str("-USDT");
    }

    if is_canonical(&s) {
        Some(s)
    } else {
        None
    }
}

fn is_canonical(s: &str) -> bool {
    let Some((base, quote)) = s.split_once('-') else {
        return false;
    };
    if base.is_empty() || !base.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return false;
    }
    matches!(quote, "USDT" | "USDC") && !quote.contains('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_with_slash() {
        assert_eq!(normalize("dot/vst-usdt").as_deref(), Some("DOT-USDT"));
    }

    #[test]
    fn already_canonical() {
        assert_eq!(normalize("DOT-USDT").as_deref(), Some("DOT-USDT"));
    }

    #[test]
    fn vst_infix_rewritten() {
        assert_eq!(normalize("DOT-VST-USDT").as_deref(), Some("DOT-USDT"));
        assert_eq!(normalize("DOT-VST-USDC").as_deref(), Some("DOT-USDC"));
    }

    #[test]
    fn missing_quote_gets_usdt_appended() {
        assert_eq!(normalize("DOT").as_deref(), Some("DOT-USDT"));
    }

    #[test]
    fn trailing_vst_without_quote_becomes_usdt() {
        assert_eq!(normalize("DOT-VST").as_deref(), Some("DOT-USDT"));
    }

    #[test]
    fn rejects_bad_characters() {
        assert_eq!(normalize("bad$name"), None);
    }

    #[test]
    fn idempotent() {
        for raw in ["dot/vst-usdt", "DOT-VST-USDT", "DOT", "BTC-USDC", "eth\\usdc"] {
            if let Some(first) = normalize(raw) {
                let second = normalize(&first).unwrap();
                assert_eq!(first, second, "normalize not idempotent for {raw}");
            }
        }
    }
}
