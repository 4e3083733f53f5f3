//! YAML-driven exclusion filter and category mapping.

use std::collections::BTreeMap;
use std::path::Path;

use aho_corasick::AhoCorasick;
use anyhow::{Context, Result};
use pricewatch_core::{normalize_title, snapshot::FilteredProduct, UNCATEGORIZED};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExclusionRulesFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    /// Filter category -> keywords matched anywhere in the title.
    #[serde(default)]
    pub title: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryRulesFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    /// Raw platform category -> canonical category. An empty value suppresses the raw category.
    #[serde(default)]
    pub category_map: BTreeMap<String, String>,
    #[serde(default)]
    pub title_rules: Vec<TitleRule>,
    #[serde(default)]
    pub tag_map: BTreeMap<String, String>,
}

/// First matching rule wins. A rule matches when the title contains one of
/// `contains_any` as whole words and, if given, one of `requires_any` too.
#[derive(Debug, Clone, Deserialize)]
pub struct TitleRule {
    pub category: String,
    pub contains_any: Vec<String>,
    #[serde(default)]
    pub requires_any: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionField {
    Title,
    Category,
    Tag,
}

impl ExclusionField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionField::Title => "title",
            ExclusionField::Category => "category",
            ExclusionField::Tag => "tag",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionMatch {
    pub field: ExclusionField,
    pub keyword: String,
    pub filter_category: String,
}

impl ExclusionMatch {
    pub fn audit_record(&self, title: &str) -> FilteredProduct {
        FilteredProduct {
            title: title.to_string(),
            reason: self.field.as_str().to_string(),
            keyword: self.keyword.clone(),
            filter_category: self.filter_category.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct KeywordSet {
    automaton: Option<AhoCorasick>,
    keywords: Vec<(String, String)>,
}

impl KeywordSet {
    fn build(by_category: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let keywords: Vec<(String, String)> = by_category
            .iter()
            .flat_map(|(category, words)| {
                words
                    .iter()
                    .filter(|w| !w.trim().is_empty())
                    .map(move |w| (w.to_lowercase(), category.clone()))
            })
            .collect();
        let automaton = if keywords.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::new(keywords.iter().map(|(k, _)| k.as_str()))
                    .context("building keyword automaton")?,
            )
        };
        Ok(Self { automaton, keywords })
    }

    fn find(&self, haystack: &str) -> Option<&(String, String)> {
        let automaton = self.automaton.as_ref()?;
        let lowered = haystack.to_lowercase();
        let found = automaton.find(&lowered)?;
        self.keywords.get(found.pattern().as_usize())
    }
}

/// Multi-pattern keyword filter for products outside the catalogue's domain.
#[derive(Debug, Clone)]
pub struct ExclusionFilter {
    title: KeywordSet,
    tags: KeywordSet,
    categories: KeywordSet,
}

impl ExclusionFilter {
    pub fn new(file: &ExclusionRulesFile) -> Result<Self> {
        Ok(Self {
            title: KeywordSet::build(&file.title).context("title keywords")?,
            tags: KeywordSet::build(&file.tags).context("tag keywords")?,
            categories: KeywordSet::build(&file.categories).context("category keywords")?,
        })
    }

    /// Checks title, then raw categories, then tags.
    pub fn check(&self, title: &str, categories: &[String], tags: &[String]) -> Option<ExclusionMatch> {
        let hit = |field: ExclusionField, (keyword, category): &(String, String)| ExclusionMatch {
            field,
            keyword: keyword.clone(),
            filter_category: category.clone(),
        };
        if let Some(found) = self.title.find(title) {
            return Some(hit(ExclusionField::Title, found));
        }
        for category in categories {
            if let Some(found) = self.categories.find(category) {
                return Some(hit(ExclusionField::Category, found));
            }
        }
        for tag in tags {
            if let Some(found) = self.tags.find(tag.trim()) {
                return Some(hit(ExclusionField::Tag, found));
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct CategoryMapper {
    direct: BTreeMap<String, String>,
    title_rules: Vec<NormalizedTitleRule>,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct NormalizedTitleRule {
    category: String,
    contains_any: Vec<String>,
    requires_any: Vec<String>,
}

fn padded_words(text: &str) -> String {
    format!(" {} ", normalize_title(text))
}

fn contains_word(padded_haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| padded_haystack.contains(n.as_str()))
}

/// Python-style title case: first letter of every alphabetic run uppercased.
pub fn title_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_alpha = false;
    for ch in raw.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

impl CategoryMapper {
    pub fn new(file: &CategoryRulesFile) -> Self {
        let lower_keys = |map: &BTreeMap<String, String>| {
            map.iter()
                .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        let words = |list: &[String]| {
            list.iter()
                .map(|w| normalize_title(w))
                .filter(|w| !w.is_empty())
                .map(|w| format!(" {w} "))
                .collect::<Vec<_>>()
        };
        Self {
            direct: lower_keys(&file.category_map),
            title_rules: file
                .title_rules
                .iter()
                .map(|rule| NormalizedTitleRule {
                    category: rule.category.clone(),
                    contains_any: words(&rule.contains_any),
                    requires_any: words(&rule.requires_any),
                })
                .collect(),
            tags: lower_keys(&file.tag_map),
        }
    }

    /// Canonical category: direct map, then title rules, then tag map, then the
    /// title-cased raw category. A suppressed raw category falls to `Uncategorized`.
    pub fn resolve(&self, raw_category: &str, title: &str, tags: &[String]) -> String {
        let raw = raw_category.trim();
        let mut suppressed = false;
        if !raw.is_empty() {
            match self.direct.get(&raw.to_lowercase()) {
                Some(mapped) if mapped.is_empty() => suppressed = true,
                Some(mapped) => return mapped.clone(),
                None => {}
            }
        }

        let haystack = padded_words(title);
        for rule in &self.title_rules {
            if contains_word(&haystack, &rule.contains_any)
                && (rule.requires_any.is_empty() || contains_word(&haystack, &rule.requires_any))
            {
                return rule.category.clone();
            }
        }

        for tag in tags {
            if let Some(mapped) = self.tags.get(&tag.trim().to_lowercase()) {
                if !mapped.is_empty() {
                    return mapped.clone();
                }
            }
        }

        if suppressed || raw.is_empty() {
            UNCATEGORIZED.to_string()
        } else {
            title_case(raw)
        }
    }
}

/// Exclusion keywords plus category mapping loaded from `rules/`.
#[derive(Debug, Clone)]
pub struct CatalogRules {
    pub exclusions: ExclusionFilter,
    pub categories: CategoryMapper,
}

impl CatalogRules {
    pub fn from_files(exclusions: &ExclusionRulesFile, categories: &CategoryRulesFile) -> Result<Self> {
        Ok(Self {
            exclusions: ExclusionFilter::new(exclusions)?,
            categories: CategoryMapper::new(categories),
        })
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let exclusions: ExclusionRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(rules_dir.join("exclusions.yaml"))
                .context("reading rules/exclusions.yaml")?,
        )
        .context("parsing rules/exclusions.yaml")?;
        let categories: CategoryRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(rules_dir.join("categories.yaml"))
                .context("reading rules/categories.yaml")?,
        )
        .context("parsing rules/categories.yaml")?;
        Self::from_files(&exclusions, &categories)
    }

    /// Rules that exclude nothing and keep raw categories.
    pub fn permissive() -> Self {
        Self {
            exclusions: ExclusionFilter {
                title: KeywordSet {
                    automaton: None,
                    keywords: Vec::new(),
                },
                tags: KeywordSet {
                    automaton: None,
                    keywords: Vec::new(),
                },
                categories: KeywordSet {
                    automaton: None,
                    keywords: Vec::new(),
                },
            },
            categories: CategoryMapper::new(&CategoryRulesFile::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXCLUSIONS: &str = r#"
version: 1
title:
  trading_cards: ["pokemon", "pokémon", "trading card"]
  collectibles: ["funko"]
categories:
  tabletop_gaming: ["warhammer"]
tags:
  collectibles: ["pop vinyl"]
"#;

    const CATEGORIES: &str = r#"
version: 1
category_map:
  gel blaster pistol: Pistols
  gbb: Pistols
  sale: ""
title_rules:
  - category: Pistols
    contains_any: ["glock", "1911", "hi-capa"]
    requires_any: ["blaster", "pistol", "gbb"]
  - category: Tactical Gear
    contains_any: ["helmet"]
tag_map:
  sniper: Snipers
"#;

    fn rules() -> CatalogRules {
        let exclusions: ExclusionRulesFile = serde_yaml::from_str(EXCLUSIONS).unwrap();
        let categories: CategoryRulesFile = serde_yaml::from_str(CATEGORIES).unwrap();
        CatalogRules::from_files(&exclusions, &categories).unwrap()
    }

    #[test]
    fn exclusion_checks_title_before_categories_and_tags() {
        let rules = rules();
        let hit = rules
            .exclusions
            .check("POKÉMON Booster Tin", &["Warhammer".into()], &[])
            .unwrap();
        assert_eq!(hit.field, ExclusionField::Title);
        assert_eq!(hit.keyword, "pokémon");
        assert_eq!(hit.filter_category, "trading_cards");

        let hit = rules
            .exclusions
            .check("Space Marine Squad", &["Warhammer 40k".into()], &["Pop Vinyl".into()])
            .unwrap();
        assert_eq!(hit.field, ExclusionField::Category);
        assert_eq!(hit.audit_record("Space Marine Squad").reason, "category");

        let hit = rules
            .exclusions
            .check("Mystery Figure", &[], &[" pop vinyl ".into()])
            .unwrap();
        assert_eq!(hit.field, ExclusionField::Tag);

        assert!(rules.exclusions.check("Glock 18C Gel Blaster", &["Pistols".into()], &[]).is_none());
    }

    #[test]
    fn category_mapping_follows_priority_order() {
        let mapper = rules().categories;
        assert_eq!(mapper.resolve("GBB", "Anything", &[]), "Pistols");
        assert_eq!(mapper.resolve("", "Glock 18C Gel Blaster", &[]), "Pistols");
        assert_eq!(mapper.resolve("", "Glock Holster", &[]), UNCATEGORIZED);
        assert_eq!(mapper.resolve("", "Hi-Capa 5.1 GBB", &[]), "Pistols");
        assert_eq!(mapper.resolve("misc", "Bolt Rifle", &["Sniper".into()]), "Snipers");
        assert_eq!(mapper.resolve("sale", "Mystery Item", &[]), UNCATEGORIZED);
        assert_eq!(mapper.resolve("sale", "Tactical Helmet", &[]), "Tactical Gear");
        assert_eq!(mapper.resolve("water bottles", "Flask", &[]), "Water Bottles");
    }

    #[test]
    fn title_case_matches_word_starts() {
        assert_eq!(title_case("gel-blaster PARTS"), "Gel-Blaster Parts");
        assert_eq!(title_case("o'neil 2x"), "O'Neil 2X");
    }

    #[test]
    fn permissive_rules_keep_everything() {
        let rules = CatalogRules::permissive();
        assert!(rules.exclusions.check("Pokemon", &[], &[]).is_none());
        assert_eq!(rules.categories.resolve("pistols", "x", &[]), "Pistols");
    }
}
