use chrono::{Days, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::COOKIE;
use reqwest::Method;
use serde::de::IgnoredAny;
use serde::Deserialize;

use super::{display_end, DateProgram, EpgError, Program, TIMESTAMP_FORMAT};
use crate::auth::Token;
use crate::channels::Channel;
use crate::client::{session_cookie, Client};

const LIVEPLAY_PATH: &str = "/EPG/jsp/liveplay_30/en/getTvodData.jsp";

lazy_static! {
    static ref BACK_LOOK_REGEX: Regex = Regex::new(r"parent\.jsonBackLookStr = (.+?);").unwrap();
}

/// `[<ignored>, [[program, ...], ...]]`, one inner list per day.
#[derive(Deserialize)]
struct BackLook(IgnoredAny, Vec<Vec<LiveplayEntry>>);

#[derive(Deserialize)]
#[serde(untagged)]
enum LiveplayEntry {
    Program(LiveplayProgram),
    Empty(EmptyObject),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyObject {}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveplayProgram {
    program_name: String,
    begin_time_format: String,
    end_time_format: String,
    start_time: String,
    end_time: String,
}

impl Client {
    pub(super) async fn fetch_liveplay(&self, token: &Token, channel: &Channel) -> Result<Vec<DateProgram>, EpgError> {
        let req = self
            .request(Method::GET, &self.url(LIVEPLAY_PATH))
            .query(&[("channelId", channel.id.as_str())])
            .header(COOKIE, session_cookie(&token.session_id));
        let body = self.epg_text(req).await?;
        let caps = BACK_LOOK_REGEX
            .captures(&body)
            .ok_or_else(|| EpgError::parse("jsonBackLookStr not found"))?;
        parse_liveplay_programs(&caps[1])
    }
}

/// Parses the `jsonBackLookStr` payload. Days are dated by their first programme.
pub fn parse_liveplay_programs(raw: &str) -> Result<Vec<DateProgram>, EpgError> {
    let BackLook(_, days) = serde_json::from_str(raw)?;
    if days.is_empty() {
        return Err(EpgError::Empty);
    }

    let mut dates = Vec::with_capacity(days.len());
    for day in days {
        let mut programs = Vec::with_capacity(day.len());
        for entry in day {
            let LiveplayEntry::Program(p) = entry else {
                continue;
            };
            let mut end_time = p.end_time_format;
            // Programmes ending at midnight carry the midnight of their own day.
            if p.end_time == "00:00" && p.begin_time_format.get(..8).map(|d| format!("{d}000000")) == Some(end_time.clone()) {
                let end = NaiveDateTime::parse_from_str(&end_time, TIMESTAMP_FORMAT)
                    .map_err(|e| EpgError::parse(format!("endTimeFormat {end_time}: {e}")))?;
                end_time = (end + Days::new(1)).format(TIMESTAMP_FORMAT).to_string();
            }
            programs.push(Program {
                name: p.program_name,
                begin_time: p.begin_time_format,
                end_time,
                display_start: p.start_time,
                display_end: display_end(&p.end_time),
            });
        }

        let Some(first) = programs.first() else {
            continue;
        };
        let date = NaiveDateTime::parse_from_str(&first.begin_time, TIMESTAMP_FORMAT)
            .map_err(|e| EpgError::parse(format!("beginTimeFormat {}: {e}", first.begin_time)))?
            .date();
        dates.push(DateProgram { date, programs });
    }
    Ok(dates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_liveplay() {
        let raw = r#"[{"x":1},[
            [
                {"beginTimeFormat":"20241130210000","programName":"新闻联播","startTime":"21:00","endTime":"21:30","endTimeFormat":"20241130213000"},
                {"beginTimeFormat":"20241130232400","isPlayable":"0","programName":"典籍里的中国Ⅱ(6)","contentId":"755597800","index":"335","startTime":"23:24","endTime":"00:00","channelId":"658582938","endTimeFormat":"20241130000000"},
                {}
            ],
            [],
            [
                {"beginTimeFormat":"20241201000000","programName":"早间","startTime":"00:00","endTime":"06:00","endTimeFormat":"20241201060000"}
            ]
        ]]"#;
        let dates = parse_liveplay_programs(raw).unwrap();
        assert_eq!(dates.len(), 2);
        assert_eq!(dates[0].date, NaiveDate::from_ymd_opt(2024, 11, 30).unwrap());
        assert_eq!(dates[0].programs.len(), 2);

        let late = &dates[0].programs[1];
        assert_eq!(late.end_time, "20241201000000");
        assert_eq!(late.display_end, "23:59");
        assert_eq!(dates[0].programs[0].display_end, "21:30");
        assert_eq!(dates[1].date, NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
    }

    #[test]
    fn test_parse_liveplay_rejects_bad_shape() {
        assert!(matches!(parse_liveplay_programs("[1,[]]"), Err(EpgError::Empty)));
        assert!(parse_liveplay_programs("[1,[[1]]]").is_err());
        assert!(parse_liveplay_programs("[1,[],3]").is_err());
        assert!(parse_liveplay_programs(r#"[1,[[{"programName":"x"}]]]"#).is_err());
        assert!(parse_liveplay_programs("{}").is_err());
    }
}
