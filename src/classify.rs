use regex::{Captures, Regex};

pub const DEFAULT_GROUP: &str = "Other";

#[derive(Debug, Clone)]
pub struct ChannelGroupRule {
    pub name: String,
    pub rules: Vec<Regex>,
}

/// A logo rule: `name` is a template where `$G<n>` is replaced with capture group `n`.
#[derive(Debug, Clone)]
pub struct ChannelLogoRule {
    pub name: String,
    pub rule: Regex,
}

impl ChannelLogoRule {
    fn resolve(&self, caps: &Captures) -> String {
        let mut name = self.name.clone();
        // Highest index first so `$G1` never eats the prefix of `$G10`.
        for i in (1..caps.len()).rev() {
            let value = caps.get(i).map(|m| m.as_str()).unwrap_or("");
            name = name.replace(&format!("$G{i}"), value);
        }
        name
    }
}

/// Compiled, ordered classification rules. Order is significant: first match wins.
#[derive(Debug, Clone)]
pub struct ChannelRules {
    pub exclude: Option<Regex>,
    pub groups: Vec<ChannelGroupRule>,
    pub logos: Vec<ChannelLogoRule>,
    pub default_group: String,
}

impl Default for ChannelRules {
    fn default() -> Self {
        Self {
            exclude: None,
            groups: Vec::new(),
            logos: Vec::new(),
            default_group: DEFAULT_GROUP.to_string(),
        }
    }
}

impl ChannelRules {
    pub fn is_excluded(&self, channel_name: &str) -> bool {
        self.exclude
            .as_ref()
            .is_some_and(|re| re.is_match(channel_name))
    }

    pub fn group_name(&self, channel_name: &str) -> String {
        self.groups
            .iter()
            .find(|group| group.rules.iter().any(|re| re.is_match(channel_name)))
            .map(|group| group.name.clone())
            .unwrap_or_else(|| self.default_group.clone())
    }

    pub fn logo_name(&self, channel_name: &str) -> String {
        for logo in &self.logos {
            if let Some(caps) = logo.rule.captures(channel_name) {
                return logo.resolve(&caps);
            }
        }
        channel_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ChannelRules {
        ChannelRules {
            exclude: Some(Regex::new("^.+?(画中画|单音轨)$").unwrap()),
            groups: vec![
                ChannelGroupRule {
                    name: "央视".to_string(),
                    rules: vec![Regex::new("^(CCTV|中央).+?$").unwrap()],
                },
                ChannelGroupRule {
                    name: "卫视".to_string(),
                    rules: vec![
                        Regex::new("^.+?卫视.*?$").unwrap(),
                        Regex::new("^CCTV-1$").unwrap(),
                    ],
                },
            ],
            logos: vec![
                ChannelLogoRule {
                    name: "CCTV$G1".to_string(),
                    rule: Regex::new(r"^CCTV-?(\d+)").unwrap(),
                },
                ChannelLogoRule {
                    name: "$G2-$G1".to_string(),
                    rule: Regex::new(r"^(\w+)\s(\w+)$").unwrap(),
                },
            ],
            default_group: DEFAULT_GROUP.to_string(),
        }
    }

    #[test]
    fn test_group_first_rule_wins() {
        let rules = rules();
        assert_eq!(rules.group_name("CCTV-1"), "央视");
        assert_eq!(rules.group_name("湖南卫视"), "卫视");
        assert_eq!(rules.group_name("家庭影院"), "Other");
    }

    #[test]
    fn test_logo_template() {
        let rules = rules();
        assert_eq!(rules.logo_name("CCTV-13 新闻"), "CCTV13");
        assert_eq!(rules.logo_name("Hunan TV"), "TV-Hunan");
        assert_eq!(rules.logo_name("家庭影院"), "家庭影院");
    }

    #[test]
    fn test_exclusion() {
        let rules = rules();
        assert!(rules.is_excluded("CCTV-1画中画"));
        assert!(rules.is_excluded("CCTV-5单音轨"));
        assert!(!rules.is_excluded("CCTV-5"));
        assert!(!ChannelRules::default().is_excluded("CCTV-1画中画"));
    }

    #[test]
    fn test_logo_placeholder_with_two_digits() {
        let re = Regex::new(r"^(a)(b)(c)(d)(e)(f)(g)(h)(i)(j)(k)$").unwrap();
        let logo = ChannelLogoRule {
            name: "$G10-$G1".to_string(),
            rule: re,
        };
        let caps = logo.rule.captures("abcdefghijk").unwrap();
        assert_eq!(logo.resolve(&caps), "j-a");
    }
}
