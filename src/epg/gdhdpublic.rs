use chrono::{Days, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use reqwest::header::COOKIE;
use reqwest::Method;
use serde::Deserialize;
use tracing::warn;

use super::{back_days, local, program, tomorrow, DateProgram, EpgError, Program};
use crate::auth::Token;
use crate::channels::Channel;
use crate::client::{session_cookie, Client};
use crate::error::IptvError;

const GDHDPUBLIC_PATH: &str = "/EPG/jsp/gdhdpublic/Ver.3/common/data.jsp";

#[derive(Deserialize)]
struct ProgramListResult {
    #[serde(default)]
    result: Vec<GdhdpublicProgram>,
}

#[derive(Deserialize)]
struct GdhdpublicProgram {
    name: String,
    /// `HH:MM:SS`
    time: String,
    endtime: String,
    /// `YYYY-MM-DD`
    day: String,
}

impl Client {
    /// Walks back one day at a time from tomorrow. A missing endpoint aborts the
    /// walk, any other failure only skips that day unless every day failed.
    pub(super) async fn fetch_gdhdpublic(&self, token: &Token, channel: &Channel) -> Result<Vec<DateProgram>, EpgError> {
        let tomorrow = tomorrow(&self.now());
        let back = back_days(channel);

        let mut dates = Vec::with_capacity(back as usize + 1);
        let mut last_err = None;
        for i in 0..=back {
            let date = tomorrow - Days::new(i);
            match self.fetch_gdhdpublic_date(token, &channel.id, date).await {
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

    async fn fetch_gdhdpublic_date(&self, token: &Token, channel_id: &str, date: NaiveDate) -> Result<Vec<Program>, EpgError> {
        let date = date.format("%Y%m%d").to_string();
        let req = self
            .request(Method::GET, &self.url(GDHDPUBLIC_PATH))
            .query(&[
                ("Action", "channelProgramList"),
                ("channelId", channel_id),
                ("date", date.as_str()),
            ])
            .header(
                COOKIE,
                format!("{}; telecomToken={}", session_cookie(&token.session_id), token.user_token),
            );
        let body = self.epg_text(req).await?;
        parse_gdhdpublic_programs(&body, &self.tz)
    }
}

pub fn parse_gdhdpublic_programs(body: &str, tz: &Tz) -> Result<Vec<Program>, EpgError> {
    let resp: ProgramListResult = serde_json::from_str(body)?;
    if resp.result.is_empty() {
        return Err(EpgError::Empty);
    }

    let parse = |day: &str, time: &str| {
        NaiveDateTime::parse_from_str(&format!("{day} {time}"), "%Y-%m-%d %H:%M:%S")
            .map_err(|e| EpgError::parse(format!("program time {day} {time}: {e}")))
    };

    let mut programs = Vec::with_capacity(resp.result.len());
    for p in &resp.result {
        let begin = local(tz, parse(&p.day, &p.time)?)?;
        let mut end = local(tz, parse(&p.day, &p.endtime)?)?;
        // An end of 00:00:00 is the following midnight.
        if end < begin {
            end = end + Days::new(1);
        }
        programs.push(program(&p.name, &begin, &end));
    }
    Ok(programs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gdhdpublic() {
        let tz: Tz = "Asia/Shanghai".parse().unwrap();
        let body = r#"{"result":[
            {"code":"1","proID":"9","proflag":"0","name":"朝闻天下","time":"06:00:00","endtime":"08:30:00","day":"2024-11-30"},
            {"code":"1","proID":"10","proflag":"0","name":"晚间新闻","time":"22:00:00","endtime":"00:00:00","day":"2024-11-30"}
        ]}"#;
        let programs = parse_gdhdpublic_programs(body, &tz).unwrap();
        assert_eq!(programs.len(), 2);
        assert_eq!(programs[0].begin_time, "20241130060000");
        assert_eq!(programs[0].display_start, "06:00");
        assert_eq!(programs[0].display_end, "08:30");

        assert_eq!(programs[1].end_time, "20241201000000");
        assert_eq!(programs[1].display_end, "23:59");
    }

    #[test]
    fn test_parse_gdhdpublic_errors() {
        let tz: Tz = "Asia/Shanghai".parse().unwrap();
        assert!(matches!(parse_gdhdpublic_programs(r#"{"result":[]}"#, &tz), Err(EpgError::Empty)));
        assert!(matches!(parse_gdhdpublic_programs("{}", &tz), Err(EpgError::Empty)));
        assert!(parse_gdhdpublic_programs("<html>", &tz).is_err());
        let bad_time = r#"{"result":[{"name":"x","time":"6点","endtime":"08:30:00","day":"2024-11-30"}]}"#;
        assert!(parse_gdhdpublic_programs(bad_time, &tz).is_err());
    }
}
