//! Programme guide acquisition.
//!
//! Deployments expose one of five mutually incompatible EPG endpoints and none of
//! them identifies itself. [`Client::fetch_all_programs`] tries them in a fixed
//! order on the first eligible channel and reports which one answered, so the
//! caller can skip probing on later cycles.

mod defaulttrans2;
mod gdhdpublic;
mod liveplay;
mod stbepg;
mod vsp;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use reqwest::{RequestBuilder, Response};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::Token;
use crate::channels::Channel;
use crate::client::Client;
use crate::error::IptvError;

pub use defaulttrans2::parse_defaulttrans2_page;
pub use gdhdpublic::parse_gdhdpublic_programs;
pub use liveplay::parse_liveplay_programs;
pub use stbepg::parse_stbepg_programs;
pub use vsp::parse_vsp_page;

/// Upper bound on how many days back a guide is requested.
pub const MAX_BACK_DAYS: u64 = 8;

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
pub(crate) const CLOCK_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    /// `YYYYMMDDhhmmss`, local to the configured timezone.
    pub begin_time: String,
    pub end_time: String,
    /// `hh:mm`
    pub display_start: String,
    /// `hh:mm`; a programme ending at midnight shows `23:59`.
    pub display_end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateProgram {
    pub date: NaiveDate,
    pub programs: Vec<Program>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProgramList {
    pub channel_id: String,
    pub channel_name: String,
    pub dates: Vec<DateProgram>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpgVariant {
    #[serde(rename = "liveplay_30")]
    Liveplay,
    #[serde(rename = "gdhdpublic")]
    Gdhdpublic,
    #[serde(rename = "vsp")]
    Vsp,
    #[serde(rename = "StbEpg2023Group")]
    StbEpg2023Group,
    #[serde(rename = "defaulttrans2")]
    Defaulttrans2,
}

impl EpgVariant {
    /// Detection order.
    pub const ALL: [EpgVariant; 5] = [
        EpgVariant::Liveplay,
        EpgVariant::Gdhdpublic,
        EpgVariant::Vsp,
        EpgVariant::StbEpg2023Group,
        EpgVariant::Defaulttrans2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EpgVariant::Liveplay => "liveplay_30",
            EpgVariant::Gdhdpublic => "gdhdpublic",
            EpgVariant::Vsp => "vsp",
            EpgVariant::StbEpg2023Group => "StbEpg2023Group",
            EpgVariant::Defaulttrans2 => "defaulttrans2",
        }
    }
}

impl fmt::Display for EpgVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum EpgError {
    /// The endpoint of this variant does not exist on the deployment (404 or 5xx).
    #[error("epg api not found")]
    NotPresent,
    #[error("the list of programs is empty")]
    Empty,
    #[error("the program date does not match the query date")]
    DateMismatch,
    #[error("no suitable EPG API found")]
    NoVariant,
    #[error(transparent)]
    Iptv(#[from] IptvError),
}

impl From<reqwest::Error> for EpgError {
    fn from(e: reqwest::Error) -> Self {
        EpgError::Iptv(IptvError::Transport(e))
    }
}

impl From<serde_json::Error> for EpgError {
    fn from(e: serde_json::Error) -> Self {
        EpgError::Iptv(IptvError::from(e))
    }
}

impl EpgError {
    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        EpgError::Iptv(IptvError::Parse(msg.into()))
    }

    /// Network-level failures: the variant could not be judged either way.
    fn is_transport(&self) -> bool {
        matches!(
            self,
            EpgError::Iptv(IptvError::Transport(_)) | EpgError::Iptv(IptvError::Cancelled)
        )
    }
}

/// Per-cycle scratch data some variants need across channels.
#[derive(Debug, Default)]
pub(crate) struct VariantState {
    /// StbEpg2023Group: channel id -> channel code.
    stb_codes: Option<HashMap<String, String>>,
}

impl Client {
    /// Fetches the guide of every catch-up channel.
    ///
    /// With `variant == None` the variant is auto-detected on the first eligible
    /// channel and returned; persisting it is up to the caller. Once a variant is
    /// chosen, a failing channel is logged and dropped. Returns `None` as the
    /// variant only when there was nothing to try.
    pub async fn fetch_all_programs(
        &self,
        token: &Token,
        channels: &[Channel],
        variant: Option<EpgVariant>,
    ) -> Result<(Option<EpgVariant>, Vec<ChannelProgramList>), EpgError> {
        let eligible: Vec<&Channel> = channels.iter().filter(|c| c.catchup_enabled()).collect();
        let mut state = VariantState::default();
        let mut epg = Vec::with_capacity(eligible.len());

        let (variant, rest) = match variant {
            Some(variant) => (variant, eligible.as_slice()),
            None => {
                let Some((first, rest)) = eligible.split_first() else {
                    return Ok((None, epg));
                };
                let (variant, result) = self.detect_variant(&mut state, token, first).await?;
                collect(&mut epg, first, result);
                (variant, rest)
            }
        };

        for channel in rest {
            let result = self.fetch_programs(variant, &mut state, token, channel).await;
            if let Err(EpgError::Iptv(IptvError::Cancelled)) = result {
                return Err(IptvError::Cancelled.into());
            }
            collect(&mut epg, channel, result);
        }

        info!("EPG acquired with {}: {} of {} channels", variant, epg.len(), eligible.len());
        Ok((Some(variant), epg))
    }

    /// Tries every variant in order on one channel. The first one that does not
    /// report [`EpgError::NotPresent`] wins, together with its result for that
    /// channel. Transport failures abort detection without choosing anything.
    pub(crate) async fn detect_variant(
        &self,
        state: &mut VariantState,
        token: &Token,
        channel: &Channel,
    ) -> Result<(EpgVariant, Result<ChannelProgramList, EpgError>), EpgError> {
        for variant in EpgVariant::ALL {
            match self.fetch_programs(variant, state, token, channel).await {
                Err(EpgError::NotPresent) => {
                    debug!("EPG API not present: variant={} channel={}", variant, channel.name);
                }
                Err(e) if e.is_transport() => return Err(e),
                result => {
                    info!("An available EPG API was found: variant={}", variant);
                    return Ok((variant, result));
                }
            }
        }
        warn!("No suitable EPG API found");
        Err(EpgError::NoVariant)
    }

    pub(crate) async fn fetch_programs(
        &self,
        variant: EpgVariant,
        state: &mut VariantState,
        token: &Token,
        channel: &Channel,
    ) -> Result<ChannelProgramList, EpgError> {
        let dates = match variant {
            EpgVariant::Liveplay => self.fetch_liveplay(token, channel).await?,
            EpgVariant::Gdhdpublic => self.fetch_gdhdpublic(token, channel).await?,
            EpgVariant::Vsp => self.fetch_vsp(token, channel).await?,
            EpgVariant::StbEpg2023Group => {
                if state.stb_codes.is_none() {
                    state.stb_codes = Some(self.fetch_stbepg_codes(token).await?);
                }
                let code = state
                    .stb_codes
                    .as_ref()
                    .and_then(|codes| codes.get(&channel.id))
                    .ok_or_else(|| EpgError::parse(format!("no channel code for {}", channel.id)))?;
                self.fetch_stbepg(token, channel, code).await?
            }
            EpgVariant::Defaulttrans2 => self.fetch_defaulttrans2(token, channel).await?,
        };
        Ok(ChannelProgramList {
            channel_id: channel.id.clone(),
            channel_name: channel.name.clone(),
            dates,
        })
    }

    /// Sends an EPG request; 404 and 5xx mean the variant is absent.
    pub(crate) async fn send_epg(&self, req: RequestBuilder) -> Result<Response, EpgError> {
        let resp = self.send(req).await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND || status.is_server_error() {
            return Err(EpgError::NotPresent);
        }
        if !status.is_success() {
            return Err(IptvError::Status(status.as_u16()).into());
        }
        Ok(resp)
    }

    pub(crate) async fn epg_text(&self, req: RequestBuilder) -> Result<String, EpgError> {
        let resp = self.send_epg(req).await?;
        Ok(self.text(resp).await?)
    }
}

fn collect(epg: &mut Vec<ChannelProgramList>, channel: &Channel, result: Result<ChannelProgramList, EpgError>) {
    match result {
        Ok(mut list) if !list.dates.is_empty() => {
            list.dates.sort_by(|a, b| a.date.cmp(&b.date));
            epg.push(list);
        }
        Ok(_) => debug!("Empty program list: channel={}", channel.name),
        Err(e) => warn!("Failed to get the program list: channel={} err={}", channel.name, e),
    }
}

/// Days to walk back from tomorrow: catch-up days plus one, capped.
pub(crate) fn back_days(channel: &Channel) -> u64 {
    (channel.catchup_days() + 1).min(MAX_BACK_DAYS)
}

pub(crate) fn tomorrow(now: &DateTime<Tz>) -> NaiveDate {
    now.date_naive() + Days::new(1)
}

pub(crate) fn local(tz: &Tz, naive: NaiveDateTime) -> Result<DateTime<Tz>, EpgError> {
    tz.from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| EpgError::parse(format!("nonexistent local time {naive}")))
}

pub(crate) fn day_start(tz: &Tz, date: NaiveDate) -> Result<DateTime<Tz>, EpgError> {
    local(tz, date.and_time(chrono::NaiveTime::MIN))
}

pub(crate) fn from_millis(tz: &Tz, millis: i64) -> Result<DateTime<Tz>, EpgError> {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.with_timezone(tz))
        .ok_or_else(|| EpgError::parse(format!("timestamp out of range: {millis}")))
}

/// Display end time with the midnight sentinel applied.
pub(crate) fn display_end(end: &str) -> String {
    if end == "00:00" {
        "23:59".to_string()
    } else {
        end.to_string()
    }
}

pub(crate) fn program(name: &str, begin: &DateTime<Tz>, end: &DateTime<Tz>) -> Program {
    Program {
        name: name.to_string(),
        begin_time: begin.format(TIMESTAMP_FORMAT).to_string(),
        end_time: end.format(TIMESTAMP_FORMAT).to_string(),
        display_start: begin.format(CLOCK_FORMAT).to_string(),
        display_end: display_end(&end.format(CLOCK_FORMAT).to_string()),
    }
}

/// Accepts `"123"` or `123` for numeric fields that some deployments quote.
pub(crate) fn deserialize_i64_lenient<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(i64),
        Str(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Accepts `"1"` or `1` for fields that are strings on some deployments only.
pub(crate) fn deserialize_string_lenient<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNum {
        Str(String),
        Num(i64),
    }

    match StringOrNum::deserialize(deserializer)? {
        StringOrNum::Str(s) => Ok(s),
        StringOrNum::Num(n) => Ok(n.to_string()),
    }
}
