/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

struct IspRule {
    code: &'static str,
    keywords: &'static [&'static str],
}

/// Carrier classification rules, in match order. Keywords are matched as
/// substrings of the upper-cased input, so 铁通 and TIETONG both land on
/// cmcc regardless of surrounding text.
const RULES: &[IspRule] = &[
    IspRule {
        code: "ct",
        keywords: &["电信", "TELECOM", "CHINANET"],
    },
    IspRule {
        code: "cu",
        keywords: &["联通", "UNICOM"],
    },
    IspRule {
        code: "cmcc",
        keywords: &["移动", "MOBILE", "TIETONG", "铁通"],
    },
    IspRule {
        code: "edu",
        keywords: &["教育", "EDU", "CERNET"],
    },
    IspRule {
        code: "gwbn",
        keywords: &["长城", "GWBN"],
    },
    IspRule {
        code: "cbn",
        keywords: &["广电", "CABLE", "CBN"],
    },
];

/// Classify a raw ISP string into its canonical code.
///
/// A rule matches when the input equals its code, or when any of its
/// keywords appears in the upper-cased input. The equality check keeps
/// already-normalized codes stable: bare `ct` contains none of its own
/// keywords, and substring-matching two-letter codes would be far too
/// loose.
pub fn isp_code(s: &str) -> Option<&'static str> {
    let trimmed = s.trim();
    let upper = trimmed.to_uppercase();
    for rule in RULES {
        if trimmed.eq_ignore_ascii_case(rule.code) {
            return Some(rule.code);
        }
        if rule.keywords.iter().any(|k| upper.contains(k)) {
            return Some(rule.code);
        }
    }
    None
}
