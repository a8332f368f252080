/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::sync::OnceLock;

/// Fixed region vocabulary: a distinguishing Chinese prefix paired with the
/// canonical code. Full administrative names (北京市, 内蒙古自治区, ...) all
/// start with one of these prefixes, so suffix variants need no entries of
/// their own. Each code is also inserted as a prefix of itself, which lets
/// already-normalized input pass through unchanged.
const REGIONS: &[(&str, &str)] = &[
    ("北京", "beijing"),
    ("天津", "tianjin"),
    ("河北", "hebei"),
    ("山西", "shanxi"),
    ("内蒙古", "neimenggu"),
    ("辽宁", "liaoning"),
    ("吉林", "jilin"),
    ("黑龙江", "heilongjiang"),
    ("上海", "shanghai"),
    ("江苏", "jiangsu"),
    ("浙江", "zhejiang"),
    ("安徽", "anhui"),
    ("福建", "fujian"),
    ("江西", "jiangxi"),
    ("山东", "shandong"),
    ("河南", "henan"),
    ("湖北", "hubei"),
    ("湖南", "hunan"),
    ("广东", "guangdong"),
    ("广西", "guangxi"),
    ("海南", "hainan"),
    ("重庆", "chongqing"),
    ("四川", "sichuan"),
    ("贵州", "guizhou"),
    ("云南", "yunnan"),
    ("西藏", "xizang"),
    ("陕西", "shaanxi"),
    ("甘肃", "gansu"),
    ("青海", "qinghai"),
    ("宁夏", "ningxia"),
    ("新疆", "xinjiang"),
    ("香港", "hk"),
    ("澳门", "mo"),
    ("台湾", "tw"),
];

#[derive(Default)]
struct TrieNode {
    code: Option<&'static str>,
    children: HashMap<char, TrieNode>,
}

struct PrefixTrie {
    root: TrieNode,
}

impl PrefixTrie {
    fn build() -> Self {
        let mut root = TrieNode::default();
        for (prefix, code) in REGIONS {
            insert(&mut root, prefix, code);
            insert(&mut root, code, code);
        }
        PrefixTrie { root }
    }

    /// Walk the input character by character and return the code of the
    /// first code-carrying node. Multi-character regions therefore win over
    /// any shorter path: 内蒙古 only yields a code at its third character,
    /// and no two-character region shares that path.
    fn lookup(&self, s: &str) -> Option<&'static str> {
        let mut node = &self.root;
        for c in s.trim().to_lowercase().chars() {
            node = node.children.get(&c)?;
            if let Some(code) = node.code {
                return Some(code);
            }
        }
        None
    }
}

fn insert(root: &mut TrieNode, prefix: &str, code: &'static str) {
    let mut node = root;
    for c in prefix.chars() {
        node = node.children.entry(c).or_default();
    }
    node.code = Some(code);
}

fn trie() -> &'static PrefixTrie {
    static TRIE: OnceLock<PrefixTrie> = OnceLock::new();
    TRIE.get_or_init(PrefixTrie::build)
}

/// Classify a raw province string into its canonical code.
pub fn province_code(s: &str) -> Option<&'static str> {
    trie().lookup(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chinese_names_with_suffixes() {
        assert_eq!(province_code("北京市"), Some("beijing"));
        assert_eq!(province_code("广东省"), Some("guangdong"));
        assert_eq!(province_code("黑龙江省"), Some("heilongjiang"));
        assert_eq!(province_code("广西壮族自治区"), Some("guangxi"));
        assert_eq!(province_code("新疆维吾尔自治区"), Some("xinjiang"));
    }

    #[test]
    fn short_forms() {
        assert_eq!(province_code("内蒙古"), Some("neimenggu"));
        assert_eq!(province_code("西藏"), Some("xizang"));
        assert_eq!(province_code("香港"), Some("hk"));
    }

    #[test]
    fn multi_char_prefix_wins() {
        // 内蒙古自治区 must resolve through the full three-character prefix.
        assert_eq!(province_code("内蒙古自治区"), Some("neimenggu"));
        // A bare 内 carries no code.
        assert_eq!(province_code("内"), None);
    }

    #[test]
    fn code_passthrough() {
        assert_eq!(province_code("beijing"), Some("beijing"));
        assert_eq!(province_code("Guangdong"), Some("guangdong"));
        assert_eq!(province_code("SHAANXI"), Some("shaanxi"));
        assert_eq!(province_code("shanxi"), Some("shanxi"));
    }

    #[test]
    fn unknown_input() {
        assert_eq!(province_code(""), None);
        assert_eq!(province_code("Mars"), None);
        assert_eq!(province_code("东京"), None);
    }
}
