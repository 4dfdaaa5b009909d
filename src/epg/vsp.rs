use chrono::Days;
use chrono_tz::Tz;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    back_days, day_start, deserialize_i64_lenient, from_millis, program, tomorrow, DateProgram, EpgError, Program,
};
use crate::auth::Token;
use crate::channels::Channel;
use crate::client::{session_cookie, Client};
use crate::error::IptvError;

const VSP_PATH: &str = "/VSP/V3/QueryPlaybillList";
const PAGE_SIZE: u64 = 100;
const RET_CODE_OK: &str = "000000000";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryPayload {
    query_channel: QueryChannel,
    query_playbill: QueryPlaybill,
    need_channel: &'static str,
}

#[derive(Serialize)]
struct QueryChannel {
    #[serde(rename = "channelIDs")]
    channel_ids: Vec<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryPlaybill {
    #[serde(rename = "type")]
    kind: &'static str,
    start_time: String,
    end_time: String,
    count: String,
    offset: String,
    is_fill_program: &'static str,
    must_included: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    result: Option<RetResult>,
    #[serde(default)]
    channel_playbills: Vec<ChannelPlaybills>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetResult {
    #[serde(default)]
    ret_code: String,
    #[serde(default)]
    ret_msg: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelPlaybills {
    #[serde(deserialize_with = "deserialize_i64_lenient")]
    playbill_count: i64,
    #[serde(default)]
    playbill_lites: Vec<PlaybillLite>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybillLite {
    name: String,
    #[serde(deserialize_with = "deserialize_i64_lenient")]
    start_time: i64,
    #[serde(deserialize_with = "deserialize_i64_lenient")]
    end_time: i64,
}

impl Client {
    pub(super) async fn fetch_vsp(&self, token: &Token, channel: &Channel) -> Result<Vec<DateProgram>, EpgError> {
        let channel_id: i64 = channel
            .id
            .parse()
            .map_err(|_| EpgError::parse(format!("channel id {} is not numeric", channel.id)))?;
        let tomorrow = tomorrow(&self.now());
        let back = back_days(channel);

        let mut dates = Vec::with_capacity(back as usize + 1);
        let mut last_err = None;
        for i in 0..=back {
            let date = tomorrow - Days::new(i);
            let start = day_start(&self.tz, date)?;
            let end = day_start(&self.tz, date + Days::new(1))?;
            match self
                .fetch_vsp_range(token, channel_id, start.timestamp_millis(), end.timestamp_millis())
                .await
            {
                Ok(programs) => dates.push(DateProgram { date, programs }),
                Err(e @ (EpgError::NotPresent | EpgError::Iptv(IptvError::Cancelled))) => return Err(e),
                Err(e) => {
                    warn!(
                        "Failed to get the program list: channel={} date={} err={}",
                        channel.name, date, e
                    );
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if dates.is_empty() => Err(e),
            _ => Ok(dates),
        }
    }

    /// Pages through one time range until the reported total is covered.
    async fn fetch_vsp_range(&self, token: &Token, channel_id: i64, start: i64, end: i64) -> Result<Vec<Program>, EpgError> {
        let mut programs = Vec::new();
        let mut offset = 0u64;
        loop {
            let payload = QueryPayload {
                query_channel: QueryChannel {
                    channel_ids: vec![channel_id],
                },
                query_playbill: QueryPlaybill {
                    kind: "0",
                    start_time: start.to_string(),
                    end_time: end.to_string(),
                    count: PAGE_SIZE.to_string(),
                    offset: offset.to_string(),
                    is_fill_program: "0",
                    must_included: "0",
                },
                need_channel: "0",
            };
            // The endpoint wants a JSON body under a form content type.
            let req = self
                .request(Method::POST, &self.url(VSP_PATH))
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded; charset=UTF-8")
                .header("X-Requested-With", "XMLHttpRequest")
                .header(COOKIE, session_cookie(&token.session_id))
                .body(serde_json::to_vec(&payload)?);
            let body = self.epg_text(req).await?;
            let (page, total) = parse_vsp_page(&body, &self.tz)?;
            programs.extend(page);

            if total <= offset + PAGE_SIZE {
                return Ok(programs);
            }
            offset += PAGE_SIZE;
            debug!("Fetching next playbill page: channel={} offset={} total={}", channel_id, offset, total);
        }
    }
}

/// Parses one `QueryPlaybillList` page into programmes plus the reported total.
pub fn parse_vsp_page(body: &str, tz: &Tz) -> Result<(Vec<Program>, u64), EpgError> {
    let resp: QueryResponse = serde_json::from_str(body)?;
    let result = resp
        .result
        .ok_or_else(|| EpgError::parse("QueryPlaybillList response has no result"))?;
    if result.ret_code != RET_CODE_OK {
        return Err(EpgError::parse(format!(
            "QueryPlaybillList failed: retCode={} retMsg={}",
            result.ret_code, result.ret_msg
        )));
    }
    let playbills = resp
        .channel_playbills
        .into_iter()
        .next()
        .ok_or_else(|| EpgError::parse("QueryPlaybillList returned no channel"))?;
    if playbills.playbill_lites.is_empty() {
        return Err(EpgError::Empty);
    }

    let programs = playbills
        .playbill_lites
        .iter()
        .map(|p| {
            let begin = from_millis(tz, p.start_time)?;
            let end = from_millis(tz, p.end_time)?;
            Ok(program(&p.name, &begin, &end))
        })
        .collect::<Result<Vec<_>, EpgError>>()?;
    Ok((programs, playbills.playbill_count.max(0) as u64))
}
