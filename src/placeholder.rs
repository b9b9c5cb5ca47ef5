//! Placeholder scanning and substitution.
//!
//! Tokens appear in three spellings: bare (`hb_native_title`), delimited
//! (`##hb_native_title##`), or ad-scoped (`hb_native_title:ad123`).
//! Exactly one scan mode is used per call: scoped when the frame may hold
//! several creatives, unscoped when an out-of-band descriptor marks the
//! frame as single-ad. Substitution is global and idempotent.

/// Page macro replaced independently of the asset list.
pub const CLICK_URL_MACRO: &str = "%%CLICK_URL_UNESC%%";

const DELIMITER: &str = "##";

/// How tokens are matched for one scan/substitute call.
#[derive(Debug, Clone, Copy)]
pub enum ScanMode<'a> {
    /// Every token must carry a `:<adId>` suffix matching this ad.
    Scoped(&'a str),
    /// Bare and `##`-delimited tokens match.
    Unscoped,
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// True when `needle` occurs in `haystack` and is not immediately
/// followed by a word character (so `hb_native_body` never matches
/// inside `hb_native_body2`).
fn contains_bounded(haystack: &str, needle: &str) -> bool {
    let mut offset = 0;
    while let Some(pos) = haystack[offset..].find(needle) {
        let end = offset + pos + needle.len();
        let boundary = haystack
            .as_bytes()
            .get(end)
            .map_or(true, |byte| !is_word_byte(*byte));
        if boundary {
            return true;
        }
        offset += pos + needle.len();
    }
    false
}

/// Replace every boundary-respecting occurrence of `needle`.
fn replace_bounded(haystack: &str, needle: &str, value: &str) -> String {
    let mut output = String::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.find(needle) {
        let end = pos + needle.len();
        output.push_str(&rest[..pos]);
        let boundary = rest.as_bytes().get(end).map_or(true, |byte| !is_word_byte(*byte));
        if boundary {
            output.push_str(value);
        } else {
            output.push_str(&rest[pos..end]);
        }
        rest = &rest[end..];
    }
    output.push_str(rest);
    output
}

/// True when `token` occurs in `markup` under `mode`, in any spelling.
pub fn token_present(markup: &str, token: &str, mode: ScanMode) -> bool {
    match mode {
        ScanMode::Scoped(ad_id) => {
            let scoped = format!("{token}:{ad_id}");
            contains_bounded(markup, &scoped)
        }
        ScanMode::Unscoped => {
            markup.contains(&format!("{DELIMITER}{token}{DELIMITER}"))
                || contains_bounded(markup, token)
        }
    }
}

/// Filter `tokens` down to those present in `markup`.
pub fn find_tokens<'t>(markup: &str, tokens: &[&'t str], mode: ScanMode) -> Vec<&'t str> {
    tokens
        .iter()
        .copied()
        .filter(|token| token_present(markup, token, mode))
        .collect()
}

/// Replace every occurrence of each token with its value. Callers pass a
/// value for every known token (empty string when no asset supplies it),
/// so no placeholder is ever left verbatim.
pub fn substitute(markup: &str, values: &[(&str, &str)], mode: ScanMode) -> String {
    // Longest token first, so hb_native_body2 is consumed before
    // hb_native_body gets a chance at its prefix.
    let mut ordered: Vec<(&str, &str)> = values.to_vec();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut output = markup.to_string();
    for (token, value) in ordered {
        match mode {
            ScanMode::Scoped(ad_id) => {
                let scoped = format!("{token}:{ad_id}");
                let delimited = format!("{DELIMITER}{scoped}{DELIMITER}");
                output = output.replace(&delimited, value);
                output = replace_bounded(&output, &scoped, value);
            }
            ScanMode::Unscoped => {
                let delimited = format!("{DELIMITER}{token}{DELIMITER}");
                output = output.replace(&delimited, value);
                output = replace_bounded(&output, token, value);
            }
        }
    }
    output
}

/// Apply the click-redirect macro: replaced with the configured prefix,
/// or removed entirely when none is configured.
pub fn apply_click_macro(markup: &str, prefix: Option<&str>) -> String {
    markup.replace(CLICK_URL_MACRO, prefix.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscoped_substitutes_bare_and_delimited() {
        let markup = "<h1>##hb_native_title##</h1><p>hb_native_body</p>";
        let out = substitute(
            markup,
            &[("hb_native_title", "Ad title"), ("hb_native_body", "Ad body")],
            ScanMode::Unscoped,
        );
        assert_eq!(out, "<h1>Ad title</h1><p>Ad body</p>");
        assert!(!out.contains("##"));
    }

    #[test]
    fn test_scoped_only_matches_own_ad_id() {
        let markup = "<a>hb_native_linkurl:ad1</a><a>hb_native_linkurl:ad2</a>";
        let out = substitute(
            markup,
            &[("hb_native_linkurl", "https://some-link.com")],
            ScanMode::Scoped("ad1"),
        );
        assert_eq!(
            out,
            "<a>https://some-link.com</a><a>hb_native_linkurl:ad2</a>"
        );
    }

    #[test]
    fn test_every_occurrence_is_replaced() {
        let markup = "hb_native_cta hb_native_cta ##hb_native_cta##";
        let out = substitute(markup, &[("hb_native_cta", "Go")], ScanMode::Unscoped);
        assert_eq!(out, "Go Go Go");
    }

    #[test]
    fn test_missing_assets_become_empty_never_verbatim() {
        let markup = "<i>##hb_native_icon##</i><b>hb_native_rating</b>";
        let out = substitute(
            markup,
            &[("hb_native_icon", ""), ("hb_native_rating", "")],
            ScanMode::Unscoped,
        );
        assert_eq!(out, "<i></i><b></b>");
    }

    #[test]
    fn test_substitution_is_idempotent() {
        let values = [
            ("hb_native_title", "Ad title"),
            ("hb_native_body", "Ad body"),
        ];
        let once = substitute(
            "##hb_native_title## hb_native_body",
            &values,
            ScanMode::Unscoped,
        );
        let twice = substitute(&once, &values, ScanMode::Unscoped);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_body_does_not_eat_body2() {
        let markup = "##hb_native_body2## and hb_native_body";
        let out = substitute(
            markup,
            &[("hb_native_body", "B"), ("hb_native_body2", "B2")],
            ScanMode::Unscoped,
        );
        assert_eq!(out, "B2 and B");
    }

    #[test]
    fn test_find_tokens_respects_mode() {
        let tokens = ["hb_native_title", "hb_native_body", "hb_native_body2"];
        let markup = "##hb_native_title## hb_native_body2:ad9";

        let unscoped = find_tokens(markup, &tokens, ScanMode::Unscoped);
        assert!(unscoped.contains(&"hb_native_title"));
        assert!(!unscoped.contains(&"hb_native_body"));

        let scoped = find_tokens(markup, &tokens, ScanMode::Scoped("ad9"));
        assert_eq!(scoped, vec!["hb_native_body2"]);
    }

    #[test]
    fn test_click_macro_with_and_without_prefix() {
        let markup = "<a href=\"%%CLICK_URL_UNESC%%https://landing\">go</a>";
        assert_eq!(
            apply_click_macro(markup, Some("https://track/?r=")),
            "<a href=\"https://track/?r=https://landing\">go</a>"
        );
        assert_eq!(
            apply_click_macro(markup, None),
            "<a href=\"https://landing\">go</a>"
        );
    }
}
