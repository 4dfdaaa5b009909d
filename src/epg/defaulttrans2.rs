use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use chrono_tz::Tz;
use reqwest::header::{COOKIE, REFERER};
use reqwest::Method;
use serde::Deserialize;
use tracing::warn;

use super::{day_start, local, program, DateProgram, EpgError, Program};
use crate::auth::Token;
use crate::channels::Channel;
use crate::client::{session_cookie, Client};
use crate::error::IptvError;

const PROG_LIST_PATH: &str = "/EPG/jsp/defaulttrans2/en/datajsp/getTvodProgListByIndex.jsp";
const REFERER_PATH: &str = "/EPG/jsp/defaulttrans2/en/chanMiniList.html";
const DEFAULT_PAGES: u64 = 7;

#[derive(Deserialize)]
struct ProgListResponse {
    #[serde(default)]
    data: Vec<ProgEntry>,
    /// Day labels, oldest first; the last one is today.
    #[serde(default)]
    title: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgEntry {
    prog_name: String,
    start_time: String,
    end_time: String,
}

impl Client {
    /// Pages are addressed by index relative to today (`0`, `-1`, ...). The first
    /// page tells how many pages exist; its day labels replace the default count.
    pub(super) async fn fetch_defaulttrans2(&self, token: &Token, channel: &Channel) -> Result<Vec<DateProgram>, EpgError> {
        let today = self.now().date_naive();
        let mut pages = DEFAULT_PAGES;
        let mut dates = Vec::new();
        let mut last_err = None;

        let mut i = 0;
        while i < pages {
            let date = today - Days::new(i);
            let index = -(i as i64);
            match self.fetch_defaulttrans2_page(token, channel, date, index).await {
                Ok((programs, titles)) => {
                    if i == 0 {
                        pages = titles as u64;
                    }
                    dates.push(DateProgram { date, programs });
                }
                Err(e @ (EpgError::NotPresent | EpgError::Iptv(IptvError::Cancelled))) => return Err(e),
                Err(EpgError::DateMismatch) => {
                    warn!("Program pages out of step with dates: channel={} date={} index={}", channel.name, date, index);
                    break;
                }
                Err(e) => {
                    warn!(
                        "Failed to get the program list: channel={} date={} index={} err={}",
                        channel.name, date, index, e
                    );
                    last_err = Some(e);
                }
            }
            i += 1;
        }
        match last_err {
            Some(e) if dates.is_empty() => Err(e),
            _ => Ok(dates),
        }
    }

    async fn fetch_defaulttrans2_page(
        &self,
        token: &Token,
        channel: &Channel,
        date: NaiveDate,
        index: i64,
    ) -> Result<(Vec<Program>, usize), EpgError> {
        let name: String = url::form_urlencoded::byte_serialize(channel.name.as_bytes()).collect();
        let cookie = format!(
            "maidianFlag=1; navNameFocus=3; jumpTime=0; channelTip=1; lastChanNum=1; \
             STARV_TIMESHFTCID={}; STARV_TIMESHFTCNAME={}; {}",
            channel.id,
            name,
            session_cookie(&token.session_id)
        );
        let req = self
            .request(Method::GET, &self.url(PROG_LIST_PATH))
            .query(&[("CHANNELID", channel.id.clone()), ("index", index.to_string())])
            .header(REFERER, self.url(REFERER_PATH))
            .header(COOKIE, cookie);
        let body = self.epg_text(req).await?;
        parse_defaulttrans2_page(&body, date, index, &self.tz)
    }
}

/// Parses one page, checking that the page's day label matches `date`.
///
/// The first programme is taken to start at midnight. The page ends at the first
/// programme that runs past midnight; anything after it belongs to the next day.
/// Returns the programmes and the number of day labels.
pub fn parse_defaulttrans2_page(body: &str, date: NaiveDate, index: i64, tz: &Tz) -> Result<(Vec<Program>, usize), EpgError> {
    let resp: ProgListResponse = serde_json::from_str(body)?;
    if resp.data.is_empty() {
        return Err(EpgError::Empty);
    }
    if resp.title.is_empty() {
        return Err(EpgError::parse("no date title list"));
    }

    let pos = resp.title.len() as i64 - 1 + index;
    let title = usize::try_from(pos)
        .ok()
        .and_then(|pos| resp.title.get(pos))
        .ok_or_else(|| EpgError::parse(format!("invalid date position: {pos}")))?;
    if !title.starts_with(&date.format("%d").to_string()) {
        return Err(EpgError::DateMismatch);
    }

    let clock = |s: &str| -> Result<NaiveTime, EpgError> {
        let s: String = s.chars().take(5).collect();
        NaiveTime::parse_from_str(&s, "%H:%M").map_err(|e| EpgError::parse(format!("program time {s}: {e}")))
    };

    let mut programs = Vec::with_capacity(resp.data.len());
    for (i, entry) in resp.data.iter().enumerate() {
        let start = if i == 0 { NaiveTime::MIN } else { clock(&entry.start_time)? };
        let begin = local(tz, NaiveDateTime::new(date, start))?;
        let end = local(tz, NaiveDateTime::new(date, clock(&entry.end_time)?))?;
        if begin > end {
            let midnight = day_start(tz, date + Days::new(1))?;
            programs.push(program(&entry.prog_name, &begin, &midnight));
            break;
        }
        programs.push(program(&entry.prog_name, &begin, &end));
    }
    Ok((programs, resp.title.len()))
}
