use std::time::Duration;

use lazy_static::lazy_static;
use md5::{Digest, Md5};
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, COOKIE, REFERER};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::auth::{Token, VALID_AUTH_PATH};
use crate::classify::ChannelRules;
use crate::client::{host_of, session_cookie, Client};
use crate::error::{IptvError, Result};

pub const SCHEME_IGMP: &str = "igmp";

const CHANNEL_LIST_PATH: &str = "/EPG/jsp/getchannellistHWCTC.jsp";

lazy_static! {
    static ref CHANNEL_REGEX: Regex = Regex::new(concat!(
        r#"ChannelID="([^"]+)",ChannelName="([^"]+)",UserChannelID="([^"]*)","#,
        r#"ChannelURL="([^"]+)",TimeShift="([^"]*)",TimeShiftLength="([^"]*)""#,
        r#".*?,TimeShiftURL="([^"]*)""#,
    ))
    .unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    /// Channel number shown to the user.
    pub user_channel_id: String,
    /// Candidate delivery URLs in feed order. Never empty.
    pub urls: Vec<Url>,
    pub time_shift: bool,
    /// Catch-up window in minutes; zero unless `time_shift` is set.
    pub time_shift_minutes: u64,
    pub time_shift_url: Option<Url>,
    pub group: String,
    pub logo: String,
}

impl Channel {
    pub fn time_shift_length(&self) -> Duration {
        Duration::from_secs(self.time_shift_minutes * 60)
    }

    pub fn catchup_enabled(&self) -> bool {
        self.time_shift && self.time_shift_minutes > 0
    }

    /// Whole days of catch-up.
    pub fn catchup_days(&self) -> u64 {
        self.time_shift_minutes / (24 * 60)
    }
}

pub fn is_multicast(url: &Url) -> bool {
    url.scheme() == SCHEME_IGMP
}

/// Picks the delivery URL for a channel.
///
/// With several candidates the first one whose multicast-ness matches the
/// preference wins. When none matches, the last URL scanned is returned, not the
/// first one. Multicast results are rewritten through the relay when one is set.
pub fn resolve_channel_url(urls: &[Url], prefer_multicast: bool, relay: Option<&str>) -> Option<String> {
    let mut selected = urls.first()?;
    for url in urls {
        selected = url;
        if is_multicast(url) == prefer_multicast {
            break;
        }
    }

    match relay.filter(|r| !r.is_empty()) {
        Some(relay) if is_multicast(selected) => {
            let host = host_of(selected)?;
            Some(format!("{}/rtp/{}", relay.trim_end_matches('/'), host))
        }
        _ => Some(selected.to_string()),
    }
}

/// Extracts channels from the raw channel-list page.
///
/// Malformed individual fields are tolerated where the channel is still usable;
/// no match at all means the feed format is not understood.
pub fn parse_channel_feed(feed: &str, rules: &ChannelRules) -> Result<Vec<Channel>> {
    let mut channels = Vec::new();
    let mut matched = 0usize;

    for caps in CHANNEL_REGEX.captures_iter(feed) {
        matched += 1;
        let name = &caps[2];
        if rules.is_excluded(name) {
            warn!("Not a normal channel, skipped: name={}", name);
            continue;
        }

        let raw_urls = &caps[4];
        let mut urls: Vec<Url> = raw_urls
            .split('|')
            .filter_map(|s| Url::parse(s.trim()).ok())
            .collect();
        if urls.is_empty() {
            warn!("Channel has no valid URL, skipped: name={} urls={}", name, raw_urls);
            continue;
        }

        let time_shift = &caps[5] == "1";
        let time_shift_minutes = match caps[6].trim().parse::<u64>() {
            Ok(minutes) => minutes,
            Err(_) => {
                warn!("Invalid TimeShiftLength, using 0: name={} value={}", name, &caps[6]);
                0
            }
        };

        let time_shift_url = match Url::parse(caps[7].trim()) {
            Ok(mut url) => {
                url.set_query(None);
                Some(url)
            }
            Err(e) => {
                warn!("Invalid TimeShiftURL, ignored: name={} value={} err={}", name, &caps[7], e);
                None
            }
        };

        // A lone multicast URL gets the catch-up URL as a unicast alternative.
        if urls.len() == 1 && is_multicast(&urls[0]) {
            if let Some(url) = &time_shift_url {
                urls.push(url.clone());
            }
        }

        channels.push(Channel {
            id: caps[1].to_string(),
            name: name.to_string(),
            user_channel_id: caps[3].to_string(),
            urls,
            time_shift,
            time_shift_minutes: if time_shift { time_shift_minutes } else { 0 },
            time_shift_url,
            group: rules.group_name(name),
            logo: rules.logo_name(name),
        });
    }

    if matched == 0 {
        return Err(IptvError::Parse("failed to extract channel list".to_string()));
    }
    Ok(channels)
}

impl Client {
    pub async fn fetch_channels(&self, token: &Token) -> Result<Vec<Channel>> {
        let temp_key = hex::encode_upper(Md5::digest(token.session_id.as_bytes()));
        let req = self
            .request(Method::POST, &self.url(CHANNEL_LIST_PATH))
            .header(REFERER, self.url(VALID_AUTH_PATH))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(COOKIE, session_cookie(&token.session_id))
            .form(&[
                ("conntype", self.config.conntype.as_str()),
                ("UserToken", token.user_token.as_str()),
                ("tempKey", temp_key.as_str()),
                ("stbid", token.stb_id.as_str()),
                ("SupportHD", "1"),
                ("UserID", self.config.user_id.as_str()),
                ("Lang", self.config.lang.as_str()),
            ]);
        let resp = self.send_ok(req).await?;
        let body = self.text(resp).await?;
        let channels = parse_channel_feed(&body, &self.rules)?;
        info!("Loaded {} channels from {}", channels.len(), self.host());
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RulesConfig;

    const FEED: &str = r#"<script>
Authentication.CTCSetConfig('Channel','ChannelID="100",ChannelName="CCTV-1",UserChannelID="1",ChannelURL="igmp://239.1.1.1:1234",TimeShift="1",TimeShiftLength="120",ChannelSDP="igmp://239.1.1.1:1234",TimeShiftURL="http://x/catchup?a=b",ChannelType="1";');
Authentication.CTCSetConfig('Channel','ChannelID="101",ChannelName="湖南卫视",UserChannelID="2",ChannelURL="igmp://239.1.1.2:1234|rtsp://10.0.0.9/live/101",TimeShift="1",TimeShiftLength="abc",ChannelSDP="",TimeShiftURL="rtsp://10.0.0.9/tv/101",ChannelType="1";');
Authentication.CTCSetConfig('Channel','ChannelID="102",ChannelName="CCTV-1画中画",UserChannelID="3",ChannelURL="igmp://239.1.1.3:1234",TimeShift="0",TimeShiftLength="0",ChannelSDP="",TimeShiftURL="",ChannelType="1";');
Authentication.CTCSetConfig('Channel','ChannelID="103",ChannelName="Broken",UserChannelID="4",ChannelURL="not a url",TimeShift="0",TimeShiftLength="0",ChannelSDP="",TimeShiftURL="",ChannelType="1";');
Authentication.CTCSetConfig('Channel','ChannelID="104",ChannelName="NoCatchup",UserChannelID="5",ChannelURL="rtsp://10.0.0.9/live/104",TimeShift="0",TimeShiftLength="60",ChannelSDP="",TimeShiftURL="::bad::",ChannelType="1";');
</script>"#;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_parse_channel_feed() {
        let rules = RulesConfig::default().compile();
        let channels = parse_channel_feed(FEED, &rules).unwrap();
        assert_eq!(channels.len(), 3);

        let cctv1 = &channels[0];
        assert_eq!(cctv1.id, "100");
        assert_eq!(cctv1.group, "央视");
        assert_eq!(cctv1.logo, "CCTV-1");
        assert_eq!(cctv1.time_shift_minutes, 120);
        assert!(cctv1.catchup_enabled());
        assert_eq!(
            cctv1.urls,
            vec![url("igmp://239.1.1.1:1234"), url("http://x/catchup")]
        );
        assert_eq!(cctv1.time_shift_url, Some(url("http://x/catchup")));

        // Non-numeric length keeps the channel with catch-up disabled.
        let hunan = &channels[1];
        assert_eq!(hunan.group, "卫视");
        assert_eq!(hunan.time_shift_minutes, 0);
        assert!(!hunan.catchup_enabled());
        assert_eq!(hunan.urls.len(), 2);

        let no_catchup = &channels[2];
        assert_eq!(no_catchup.id, "104");
        assert!(no_catchup.time_shift_url.is_none());
        assert_eq!(no_catchup.time_shift_minutes, 0);
        assert_eq!(no_catchup.group, "Other");
    }

    #[test]
    fn test_parse_channel_feed_rejects_unknown_format() {
        let rules = ChannelRules::default();
        assert!(matches!(
            parse_channel_feed("<html>nothing here</html>", &rules),
            Err(IptvError::Parse(_))
        ));
    }

    #[test]
    fn test_resolve_prefers_matching_kind() {
        let urls = vec![url("igmp://239.1.1.1:1234"), url("rtsp://10.0.0.9/live/1")];
        assert_eq!(
            resolve_channel_url(&urls, false, None).as_deref(),
            Some("rtsp://10.0.0.9/live/1")
        );
        assert_eq!(
            resolve_channel_url(&urls, true, None).as_deref(),
            Some("igmp://239.1.1.1:1234")
        );
        assert_eq!(
            resolve_channel_url(&urls, true, Some("http://192.168.1.1:4022/")).as_deref(),
            Some("http://192.168.1.1:4022/rtp/239.1.1.1:1234")
        );
    }

    #[test]
    fn test_resolve_single_url_ignores_preference() {
        let urls = vec![url("igmp://239.1.1.1:1234")];
        assert_eq!(
            resolve_channel_url(&urls, false, Some("http://relay:4022")).as_deref(),
            Some("http://relay:4022/rtp/239.1.1.1:1234")
        );
        assert_eq!(
            resolve_channel_url(&urls, false, None).as_deref(),
            Some("igmp://239.1.1.1:1234")
        );
        assert_eq!(resolve_channel_url(&[], true, None), None);
    }

    #[test]
    fn test_resolve_falls_back_to_last_scanned() {
        let urls = vec![
            url("rtsp://10.0.0.9/live/1"),
            url("http://10.0.0.9/live/2"),
            url("rtsp://10.0.0.9/live/3"),
        ];
        assert_eq!(
            resolve_channel_url(&urls, true, Some("http://relay:4022")).as_deref(),
            Some("rtsp://10.0.0.9/live/3")
        );
    }
}
