//! Name filters for the `VK_LOADER_LAYERS_*` and `VK_LOADER_DRIVERS_*`
//! variables.
//!
//! A filter value is a comma separated list of tokens. Stars select the
//! match kind: `foo*` is a prefix match, `*foo` a suffix match, `*foo*` a
//! substring match and a plain `foo` an exact match. Tokens starting with `~`
//! are special identifiers (`~all~`, `~implicit~`, `~explicit~`), and a bare
//! `*` or `**` means everything. Matching ignores ASCII case.

/// Rules beyond this count are ignored.
pub const MAX_FILTER_RULES: usize = 16;

/// Spellings that mean "every name".
pub const MATCH_ALL_TOKENS: [&str; 3] = ["~all~", "*", "**"];
pub const DISABLE_IMPLICIT_TOKEN: &str = "~implicit~";
pub const DISABLE_EXPLICIT_TOKEN: &str = "~explicit~";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Full,
    Prefix,
    Suffix,
    Substring,
    Special,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterRule {
    pub kind: FilterKind,
    /// Pattern with the kind-selecting stars removed.
    pub pattern: String,
    pub length: usize,
}

impl FilterRule {
    /// Classify one (already lower-cased) token.
    pub fn classify(token: &str) -> Self {
        let (kind, pattern) = if token.starts_with('~') || token == "*" || token == "**" {
            (FilterKind::Special, token)
        } else {
            let star_begin = token.starts_with('*');
            let star_end = token.ends_with('*');
            match (star_begin, star_end) {
                (true, true) => (FilterKind::Substring, &token[1..token.len() - 1]),
                (true, false) => (FilterKind::Suffix, &token[1..]),
                (false, true) => (FilterKind::Prefix, &token[..token.len() - 1]),
                (false, false) => (FilterKind::Full, token),
            }
        };
        FilterRule {
            kind,
            pattern: pattern.to_string(),
            length: pattern.len(),
        }
    }

    /// `lowered` must already be ASCII lower-case.
    fn matches_lowered(&self, lowered: &str) -> bool {
        if self.length > lowered.len() {
            return false;
        }
        match self.kind {
            FilterKind::Special => MATCH_ALL_TOKENS.contains(&self.pattern.as_str()),
            FilterKind::Substring => lowered.contains(self.pattern.as_str()),
            FilterKind::Suffix => lowered.ends_with(self.pattern.as_str()),
            FilterKind::Prefix => lowered.starts_with(self.pattern.as_str()),
            FilterKind::Full => lowered == self.pattern,
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.kind == FilterKind::Special && MATCH_ALL_TOKENS.contains(&self.pattern.as_str())
    }
}

fn tokens(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .filter(|token| !token.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Ordered set of at most [`MAX_FILTER_RULES`] rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FilterSet {
    rules: Vec<FilterRule>,
}

impl FilterSet {
    pub fn parse(value: &str) -> Self {
        let rules = tokens(value)
            .take(MAX_FILTER_RULES)
            .map(|token| FilterRule::classify(&token))
            .collect();
        FilterSet { rules }
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when any rule matches `name`.
    pub fn matches(&self, name: &str) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let lowered = name.to_ascii_lowercase();
        self.rules.iter().any(|rule| rule.matches_lowered(&lowered))
    }
}

/// `VK_LOADER_LAYERS_DISABLE`: a [`FilterSet`] plus the three blanket
/// switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DisableFilter {
    pub disable_all: bool,
    pub disable_all_implicit: bool,
    pub disable_all_explicit: bool,
    pub additional: FilterSet,
}

impl DisableFilter {
    pub fn parse(value: &str) -> Self {
        let mut filter = DisableFilter::default();
        for token in tokens(value) {
            let rule = FilterRule::classify(&token);
            if rule.kind == FilterKind::Special {
                if rule.is_match_all() {
                    filter.disable_all = true;
                } else if token == DISABLE_IMPLICIT_TOKEN {
                    filter.disable_all_implicit = true;
                } else if token == DISABLE_EXPLICIT_TOKEN {
                    filter.disable_all_explicit = true;
                }
                continue;
            }
            filter.additional.rules.push(rule);
            if filter.additional.rules.len() >= MAX_FILTER_RULES {
                break;
            }
        }
        filter
    }

    pub fn is_empty(&self) -> bool {
        !self.disable_all
            && !self.disable_all_implicit
            && !self.disable_all_explicit
            && self.additional.is_empty()
    }

    /// Whether a layer with this name and kind is disabled.
    pub fn rejects(&self, name: &str, implicit: bool) -> bool {
        let by_type = if implicit {
            self.disable_all_implicit
        } else {
            self.disable_all_explicit
        };
        self.disable_all || by_type || self.additional.matches(name)
    }
}
