use std::collections::HashMap;

use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::classify::{ChannelGroupRule, ChannelLogoRule, ChannelRules, DEFAULT_GROUP};
use crate::epg::EpgVariant;
use crate::error::{IptvError, Result};

/// Lower bound for the refresh interval.
pub const MIN_INTERVAL_MINUTES: u64 = 15;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    pub iptv: IptvConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

impl Settings {
    /// Loads a TOML/YAML/JSON file (by extension) with `IPTV__`-prefixed env overrides.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("IPTV").separator("__"))
            .build()?;
        let settings: Settings = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.iptv.validate()?;
        self.server.timezone()?;
        if self.server.interval_minutes < MIN_INTERVAL_MINUTES {
            return Err(IptvError::Config(format!(
                "interval cannot be less than {MIN_INTERVAL_MINUTES} minutes"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL of a udpxy-style relay, e.g. `http://192.168.1.1:4022`.
    #[serde(default)]
    pub udpxy_url: Option<String>,
    /// Prefix for `tvg-logo`; logos are `{logo_base_url}/{logo}.png`.
    #[serde(default)]
    pub logo_base_url: Option<String>,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            udpxy_url: None,
            logo_base_url: None,
            interval_minutes: default_interval_minutes(),
            timezone: default_timezone(),
        }
    }
}

impl ServerConfig {
    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| IptvError::Config(format!("timezone {}: {e}", self.timezone)))
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_interval_minutes() -> u64 {
    24 * 60
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

/// Device identity and middleware address. Most values are captured from a real
/// set-top box's traffic.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IptvConfig {
    /// Shared secret used to encrypt the Authenticator.
    pub key: String,
    pub server_host: String,
    pub headers: HashMap<String, String>,
    /// If set, the IPv4 of this interface is used instead of `ip`.
    pub interface_name: Option<String>,
    pub ip: String,
    pub user_id: String,
    pub lang: String,
    pub net_user_id: String,
    pub stb_type: String,
    pub stb_version: String,
    pub conntype: String,
    pub stb_id: String,
    pub template_name: String,
    pub area_id: String,
    pub user_group_id: String,
    pub product_package_id: String,
    pub mac: String,
    pub user_field: String,
    pub software_version: String,
    pub is_smart_stb: String,
    pub vip: String,
    /// Skips EPG auto-detection when set.
    pub epg_variant: Option<EpgVariant>,
}

impl IptvConfig {
    pub fn validate(&self) -> Result<()> {
        let has_ip = !self.ip.is_empty()
            || self.interface_name.as_deref().is_some_and(|s| !s.is_empty());
        let required = [
            ("key", &self.key),
            ("server_host", &self.server_host),
            ("user_id", &self.user_id),
            ("stb_type", &self.stb_type),
            ("stb_version", &self.stb_version),
            ("stb_id", &self.stb_id),
            ("mac", &self.mac),
            ("software_version", &self.software_version),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.is_empty()) {
            return Err(IptvError::Config(format!("{name} is required")));
        }
        if !has_ip {
            return Err(IptvError::Config(
                "either ip or interface_name is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupRuleConfig {
    pub name: String,
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogoRuleConfig {
    /// Logo key template, may reference `$G1`, `$G2`, ...
    pub name: String,
    pub rule: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_exclude")]
    pub exclude: Option<String>,
    #[serde(default = "default_groups")]
    pub groups: Vec<GroupRuleConfig>,
    #[serde(default)]
    pub logos: Vec<LogoRuleConfig>,
    #[serde(default = "default_group_name")]
    pub default_group: String,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
            groups: default_groups(),
            logos: Vec::new(),
            default_group: default_group_name(),
        }
    }
}

fn default_exclude() -> Option<String> {
    Some("^.+?(画中画|单音轨)$".to_string())
}

fn default_group_name() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_groups() -> Vec<GroupRuleConfig> {
    let group = |name: &str, rules: &[&str]| GroupRuleConfig {
        name: name.to_string(),
        rules: rules.iter().map(|r| r.to_string()).collect(),
    };
    vec![
        group("央视", &["^(CCTV|中央).+?$"]),
        group("卫视", &["^.+?卫视.*?$"]),
        group("国际", &["^(CGTN|凤凰).+?$"]),
        group(
            "地方",
            &[
                "^(SCTV|CDTV).+?$",
                "^(浙江|杭州|民生|钱江|教科影视|好易购|西湖|青少体育).+?$",
                "^(湖北|武汉).+?$",
            ],
        ),
        group("专区", &[".+?专区$"]),
    ]
}

impl RulesConfig {
    /// Compiles the rule lists. Empty or invalid entries are logged and skipped.
    pub fn compile(&self) -> ChannelRules {
        let exclude = self
            .exclude
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| match Regex::new(s) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Invalid channel exclude rule, ignored: rule={} err={}", s, e);
                    None
                }
            });

        let mut groups = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            if group.name.is_empty() {
                warn!("Channel group name is empty, skipped");
                continue;
            }
            let rules: Vec<Regex> = group
                .rules
                .iter()
                .filter_map(|r| match Regex::new(r) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!("Invalid channel group rule, skipped: group={} rule={} err={}", group.name, r, e);
                        None
                    }
                })
                .collect();
            if rules.is_empty() {
                warn!("Channel group has no usable rules, skipped: group={}", group.name);
                continue;
            }
            groups.push(ChannelGroupRule {
                name: group.name.clone(),
                rules,
            });
        }

        let logos = self
            .logos
            .iter()
            .filter_map(|logo| match Regex::new(&logo.rule) {
                Ok(rule) if !logo.name.is_empty() => Some(ChannelLogoRule {
                    name: logo.name.clone(),
                    rule,
                }),
                Ok(_) => {
                    warn!("Channel logo name is empty, skipped: rule={}", logo.rule);
                    None
                }
                Err(e) => {
                    warn!("Invalid channel logo rule, skipped: name={} rule={} err={}", logo.name, logo.rule, e);
                    None
                }
            })
            .collect();

        ChannelRules {
            exclude,
            groups,
            logos,
            default_group: self.default_group.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iptv_config() -> IptvConfig {
        IptvConfig {
            key: "12345678".to_string(),
            server_host: "10.0.0.1:8080".to_string(),
            ip: "10.0.0.2".to_string(),
            user_id: "user".to_string(),
            stb_type: "EC6108V9".to_string(),
            stb_version: "1.0".to_string(),
            stb_id: "STB".to_string(),
            mac: "00:11:22:33:44:55".to_string(),
            software_version: "2.0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_required_fields() {
        assert!(iptv_config().validate().is_ok());

        let mut cfg = iptv_config();
        cfg.mac.clear();
        assert!(matches!(cfg.validate(), Err(IptvError::Config(msg)) if msg.contains("mac")));

        let mut cfg = iptv_config();
        cfg.ip.clear();
        assert!(cfg.validate().is_err());
        cfg.interface_name = Some("eth0".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_interval_minimum() {
        let mut settings = Settings {
            server: ServerConfig::default(),
            iptv: iptv_config(),
            rules: RulesConfig::default(),
        };
        assert!(settings.validate().is_ok());
        settings.server.interval_minutes = 5;
        assert!(settings.validate().is_err());
        settings.server.interval_minutes = 15;
        settings.server.timezone = "Mars/Olympus".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_compile_skips_bad_rules() {
        let rules = RulesConfig {
            exclude: Some("(".to_string()),
            groups: vec![
                GroupRuleConfig { name: "".to_string(), rules: vec!["x".to_string()] },
                GroupRuleConfig { name: "bad".to_string(), rules: vec!["(".to_string()] },
                GroupRuleConfig { name: "ok".to_string(), rules: vec!["(".to_string(), "^ok".to_string()] },
            ],
            logos: vec![
                LogoRuleConfig { name: "L$G1".to_string(), rule: "^(\\d+)".to_string() },
                LogoRuleConfig { name: "x".to_string(), rule: "[".to_string() },
            ],
            default_group: "其他".to_string(),
        }
        .compile();

        assert!(rules.exclude.is_none());
        assert_eq!(rules.groups.len(), 1);
        assert_eq!(rules.groups[0].rules.len(), 1);
        assert_eq!(rules.logos.len(), 1);
        assert_eq!(rules.group_name("nope"), "其他");
    }

    #[test]
    fn test_default_rules() {
        let rules = RulesConfig::default().compile();
        assert_eq!(rules.group_name("CCTV-1"), "央视");
        assert_eq!(rules.group_name("湖南卫视"), "卫视");
        assert_eq!(rules.group_name("浙江经视"), "地方");
        assert!(rules.is_excluded("CCTV-1画中画"));
    }

    #[test]
    fn test_deserialize_settings() {
        let toml = r#"
            [server]
            port = 9000
            udpxy_url = "http://192.168.1.1:4022"

            [iptv]
            key = "12345678"
            server_host = "10.0.0.1:8080"
            ip = "10.0.0.2"
            user_id = "user"
            stb_type = "EC6108V9"
            stb_version = "1.0"
            stb_id = "STB"
            mac = "00:11:22:33:44:55"
            software_version = "2.0"
            epg_variant = "vsp"
        "#;
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.interval_minutes, 24 * 60);
        assert_eq!(settings.iptv.epg_variant, Some(EpgVariant::Vsp));
        assert_eq!(settings.rules.groups.len(), 5);
        assert!(settings.validate().is_ok());
    }
}
