use std::collections::{BTreeMap, HashMap};

use chrono::{Days, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use reqwest::header::COOKIE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::info;

use super::{
    back_days, deserialize_i64_lenient, deserialize_string_lenient, from_millis, local, program, tomorrow,
    DateProgram, EpgError,
};
use crate::auth::Token;
use crate::channels::Channel;
use crate::client::{session_cookie, Client};

const PROPERTIES_PATH: &str = "/EPG/jsp/StbEpg2023Group/en/function/ajax/epg7getProperties.jsp";
const CHANNEL_AJAX_PATH: &str = "/EPG/jsp/StbEpg2023Group/en/function/ajax/epg7getChannelByAjax.jsp";
const ALL_CATEGORY: &str = "全部";
const STATUS_OK: &str = "1";
const PROGRAM_LIMIT: &str = "2000";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AjaxResponse<T> {
    data: Option<T>,
    #[serde(default, deserialize_with = "deserialize_string_lenient")]
    status: String,
    #[serde(default)]
    err_msg: Option<String>,
}

#[derive(Deserialize)]
struct Category {
    name: String,
    #[serde(deserialize_with = "deserialize_string_lenient")]
    id: String,
}

#[derive(Deserialize)]
struct StbChannel {
    #[serde(rename = "ID", deserialize_with = "deserialize_string_lenient")]
    id: String,
    code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelProgram {
    name: String,
    #[serde(deserialize_with = "deserialize_i64_lenient")]
    start_time: i64,
    #[serde(deserialize_with = "deserialize_i64_lenient")]
    end_time: i64,
}

/// Unwraps the `{data, errCode, errMsg, status}` envelope.
fn unwrap_response<T: DeserializeOwned>(body: &str) -> Result<Option<T>, EpgError> {
    let resp: AjaxResponse<T> = serde_json::from_str(body)?;
    if resp.status != STATUS_OK {
        return Err(EpgError::parse(format!(
            "the API returned failed: status={} errMsg={}",
            resp.status,
            resp.err_msg.unwrap_or_default()
        )));
    }
    Ok(resp.data)
}

impl Client {
    async fn stbepg_post(&self, path: &str, token: &Token, form: &[(&str, &str)]) -> Result<String, EpgError> {
        let req = self
            .request(Method::POST, &self.url(path))
            .header("VIS-AJAX", "AjaxHttpRequest")
            .header(COOKIE, session_cookie(&token.session_id))
            .form(form);
        self.epg_text(req).await
    }

    /// Resolves the "all channels" category and maps channel ids to the codes this
    /// variant addresses channels by.
    pub(super) async fn fetch_stbepg_codes(&self, token: &Token) -> Result<HashMap<String, String>, EpgError> {
        let body = self
            .stbepg_post(PROPERTIES_PATH, token, &[("action", "getChannelCate")])
            .await?;
        let categories: Vec<Category> = unwrap_response(&body)?.unwrap_or_default();
        let category_id = categories
            .into_iter()
            .find(|c| c.name == ALL_CATEGORY)
            .map(|c| c.id)
            .ok_or_else(|| EpgError::parse("channel category not found"))?;

        let body = self
            .stbepg_post(
                CHANNEL_AJAX_PATH,
                token,
                &[("action", "getChannelList"), ("cateID", category_id.as_str()), ("type", "")],
            )
            .await?;
        let channels: Vec<StbChannel> = unwrap_response(&body)?.unwrap_or_default();
        if channels.is_empty() {
            return Err(EpgError::parse("no channel list"));
        }
        info!("Resolved {} channel codes: category={}", channels.len(), category_id);
        Ok(channels.into_iter().map(|c| (c.id, c.code)).collect())
    }

    pub(super) async fn fetch_stbepg(&self, token: &Token, channel: &Channel, code: &str) -> Result<Vec<DateProgram>, EpgError> {
        let (start, end) = query_window(tomorrow(&self.now()), back_days(channel), &self.tz)?;
        let (start, end) = (start.to_string(), end.to_string());

        let body = self
            .stbepg_post(
                CHANNEL_AJAX_PATH,
                token,
                &[
                    ("action", "getChannelProg"),
                    ("code", code),
                    ("channelID", channel.id.as_str()),
                    ("endTime", end.as_str()),
                    ("startTime", start.as_str()),
                    ("offset", "0"),
                    ("limit", PROGRAM_LIMIT),
                ],
            )
            .await?;
        parse_stbepg_programs(&body, &self.tz)
    }
}

/// `[first day 00:00:01, tomorrow 23:59:59]` in epoch milliseconds, whole seconds only.
fn query_window(tomorrow: NaiveDate, back: u64, tz: &Tz) -> Result<(i64, i64), EpgError> {
    let first = tomorrow - Days::new(back);
    let start = local(tz, first.and_time(window_time(0, 0, 1)))?;
    let end = local(tz, tomorrow.and_time(window_time(23, 59, 59)))?;
    Ok((start.timestamp_millis(), end.timestamp_millis()))
}

fn window_time(h: u32, m: u32, s: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, s).unwrap_or(NaiveTime::MIN)
}

/// Parses a `getChannelProg` response and groups programmes by local start date.
pub fn parse_stbepg_programs(body: &str, tz: &Tz) -> Result<Vec<DateProgram>, EpgError> {
    let programs: Vec<ChannelProgram> = unwrap_response(body)?.unwrap_or_default();
    if programs.is_empty() {
        return Err(EpgError::Empty);
    }

    let mut by_date = BTreeMap::new();
    for p in &programs {
        let begin = from_millis(tz, p.start_time)?;
        let end = from_millis(tz, p.end_time)?;
        by_date
            .entry(begin.date_naive())
            .or_insert_with(Vec::new)
            .push(program(&p.name, &begin, &end));
    }
    Ok(by_date
        .into_iter()
        .map(|(date, programs)| DateProgram { date, programs })
        .collect())
}
