//! Integration test: name filters
//!
//! Token classification, matching, and the disable filter's blanket
//! switches.
//!
//! Run with: cargo test -p vkchain-core --test filter_test

use vkchain_core::filter::{DisableFilter, FilterKind, FilterRule, FilterSet, MAX_FILTER_RULES};

#[test]
fn test_classify_star_positions() {
    let cases = [
        ("*foo*", FilterKind::Substring, "foo"),
        ("foo*", FilterKind::Prefix, "foo"),
        ("*foo", FilterKind::Suffix, "foo"),
        ("foo", FilterKind::Full, "foo"),
        ("~all~", FilterKind::Special, "~all~"),
        ("*", FilterKind::Special, "*"),
        ("**", FilterKind::Special, "**"),
    ];
    for (token, kind, pattern) in cases {
        let rule = FilterRule::classify(token);
        assert_eq!(rule.kind, kind, "token {:?}", token);
        assert_eq!(rule.pattern, pattern, "token {:?}", token);
        assert_eq!(rule.length, pattern.len());
    }
}

#[test]
fn test_matches_agrees_with_direct_string_tests() {
    let names = [
        "VK_LAYER_KHRONOS_validation",
        "vk_layer_foo",
        "foo",
        "my_foo_layer",
        "fo",
        "FOOBAR",
        "barfoo",
    ];
    let patterns = ["foo", "layer", "vk_layer", "validation", "o"];
    for pattern in patterns {
        for name in names {
            let lowered = name.to_ascii_lowercase();
            let sub = FilterSet::parse(&format!("*{}*", pattern));
            let prefix = FilterSet::parse(&format!("{}*", pattern));
            let suffix = FilterSet::parse(&format!("*{}", pattern));
            let full = FilterSet::parse(pattern);
            assert_eq!(sub.matches(name), lowered.contains(pattern), "*{}* vs {}", pattern, name);
            assert_eq!(prefix.matches(name), lowered.starts_with(pattern), "{}* vs {}", pattern, name);
            assert_eq!(suffix.matches(name), lowered.ends_with(pattern), "*{} vs {}", pattern, name);
            assert_eq!(full.matches(name), lowered == pattern, "{} vs {}", pattern, name);
        }
    }
}

#[test]
fn test_matching_ignores_case() {
    let filter = FilterSet::parse("VK_LAYER_KHRONOS_*");
    assert!(filter.matches("vk_layer_khronos_validation"));
    assert!(filter.matches("VK_LAYER_KHRONOS_VALIDATION"));
    assert!(!filter.matches("VK_LAYER_LUNARG_api_dump"));
}

#[test]
fn test_rule_longer_than_name_never_matches() {
    let filter = FilterSet::parse("*abcdef*");
    assert!(!filter.matches("abc"));
}

#[test]
fn test_special_tokens_match_everything_only_for_all_spellings() {
    for token in ["~all~", "*", "**"] {
        assert!(FilterSet::parse(token).matches("anything_at_all"), "{}", token);
    }
    assert!(!FilterSet::parse("~implicit~").matches("some_long_layer_name"));
}

#[test]
fn test_empty_tokens_skipped_and_rule_count_capped() {
    assert!(FilterSet::parse(",,,").is_empty());
    let many: Vec<String> = (0..(MAX_FILTER_RULES + 8)).map(|i| format!("layer{}", i)).collect();
    let filter = FilterSet::parse(&many.join(","));
    assert_eq!(filter.len(), MAX_FILTER_RULES);
    assert!(filter.matches("layer0"));
    assert!(!filter.matches(&format!("layer{}", MAX_FILTER_RULES)));
}

#[test]
fn test_empty_filter_matches_nothing() {
    assert!(!FilterSet::default().matches("VK_LAYER_anything"));
}

#[test]
fn test_disable_filter_blanket_switches() {
    let filter = DisableFilter::parse("~implicit~");
    assert!(filter.disable_all_implicit);
    assert!(filter.rejects("VK_LAYER_implicit_thing", true));
    assert!(!filter.rejects("VK_LAYER_explicit_thing", false));

    let filter = DisableFilter::parse("~explicit~");
    assert!(filter.rejects("VK_LAYER_explicit_thing", false));
    assert!(!filter.rejects("VK_LAYER_implicit_thing", true));

    for token in ["~all~", "*", "**"] {
        let filter = DisableFilter::parse(token);
        assert!(filter.disable_all, "{}", token);
        assert!(filter.additional.is_empty());
        assert!(filter.rejects("x", true) && filter.rejects("x", false));
    }
}

#[test]
fn test_disable_filter_additional_rules() {
    let filter = DisableFilter::parse("~implicit~,*capture*,VK_LAYER_exact");
    assert_eq!(filter.additional.len(), 2);
    assert!(filter.rejects("VK_LAYER_LUNARG_gfxreconstruct_capture_layer", false));
    assert!(filter.rejects("vk_layer_exact", false));
    assert!(!filter.rejects("VK_LAYER_other", false));
    assert!(!DisableFilter::default().rejects("anything", true));
    assert!(DisableFilter::default().is_empty());
}
