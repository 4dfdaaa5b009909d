//! Playlist and guide renderers for the published snapshot.

use std::fmt::Write as _;

use chrono::{Days, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Serialize;

use crate::channels::{resolve_channel_url, Channel};
use crate::epg::{ChannelProgramList, TIMESTAMP_FORMAT};

const GENERATOR_NAME: &str = "iptv-relay";
const DIYP_CATCHUP_SOURCE: &str = "?playseek=${(b)yyyyMMddHHmmss}-${(e)yyyyMMddHHmmss}";
const KODI_CATCHUP_SOURCE: &str = "?playseek={utc:YmdHMS}-{utcend:YmdHMS}";

/// Placeholder syntax appended to catch-up URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchupFormat {
    #[default]
    Diyp,
    Kodi,
}

impl CatchupFormat {
    /// `"1"` selects Kodi, anything else DIYP.
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("1") => CatchupFormat::Kodi,
            _ => CatchupFormat::Diyp,
        }
    }

    fn source(&self) -> &'static str {
        match self {
            CatchupFormat::Diyp => DIYP_CATCHUP_SOURCE,
            CatchupFormat::Kodi => KODI_CATCHUP_SOURCE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlaylistOptions {
    pub relay: Option<String>,
    pub multicast_first: bool,
    pub catchup: CatchupFormat,
    pub logo_base_url: Option<String>,
}

fn channel_url(channel: &Channel, opts: &PlaylistOptions) -> Option<String> {
    resolve_channel_url(&channel.urls, opts.multicast_first, opts.relay.as_deref())
}

pub fn to_m3u(channels: &[Channel], opts: &PlaylistOptions) -> String {
    let mut out = String::from("#EXTM3U\n");
    for channel in channels {
        let Some(url) = channel_url(channel, opts) else {
            continue;
        };
        let _ = write!(
            out,
            "#EXTINF:-1 tvg-id=\"{}\" tvg-chno=\"{}\"",
            channel.id, channel.user_channel_id
        );
        if let Some(base) = opts.logo_base_url.as_deref().filter(|b| !b.is_empty()) {
            let _ = write!(out, " tvg-logo=\"{}/{}.png\"", base.trim_end_matches('/'), channel.logo);
        }
        if let (true, Some(catchup_url)) = (channel.catchup_enabled(), &channel.time_shift_url) {
            let _ = write!(
                out,
                " catchup=\"default\" catchup-source=\"{}{}\" catchup-days=\"{}\"",
                catchup_url,
                opts.catchup.source(),
                channel.catchup_days()
            );
        }
        let _ = writeln!(out, " group-title=\"{}\",{}\n{}", channel.group, channel.name, url);
    }
    out
}

/// `group,#genre#` blocks, groups in order of first appearance.
pub fn to_txt(channels: &[Channel], opts: &PlaylistOptions) -> String {
    let mut groups: Vec<(&str, Vec<&Channel>)> = Vec::new();
    for channel in channels {
        match groups.iter_mut().find(|(name, _)| *name == channel.group) {
            Some((_, members)) => members.push(channel),
            None => groups.push((&channel.group, vec![channel])),
        }
    }

    let mut out = String::new();
    for (group, members) in groups {
        let _ = writeln!(out, "{group},#genre#");
        for channel in members {
            if let Some(url) = channel_url(channel, opts) {
                let _ = writeln!(out, "{},{}", channel.name, url);
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JsonEpg {
    pub channel_name: String,
    pub date: String,
    pub epg_data: Vec<JsonEpgEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JsonEpgEntry {
    pub title: String,
    pub desc: String,
    pub start: String,
    pub end: String,
}

/// One channel's programmes for one day. Unknown channels or days give an empty list.
pub fn to_json_epg(epg: &[ChannelProgramList], channel_name: &str, date: NaiveDate) -> JsonEpg {
    let epg_data = epg
        .iter()
        .find(|p| p.channel_name == channel_name)
        .and_then(|p| p.dates.iter().find(|d| d.date == date))
        .map(|d| {
            d.programs
                .iter()
                .map(|p| JsonEpgEntry {
                    title: p.name.clone(),
                    desc: String::new(),
                    start: p.display_start.clone(),
                    end: p.display_end.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    JsonEpg {
        channel_name: channel_name.to_string(),
        date: date.format("%Y-%m-%d").to_string(),
        epg_data,
    }
}

/// XMLTV document. With `back_days > 0` only days from `today - back_days` on are kept.
pub fn to_xmltv(epg: &[ChannelProgramList], back_days: u64, today: NaiveDate, tz: &Tz) -> anyhow::Result<String> {
    let oldest = today.checked_sub_days(Days::new(back_days)).unwrap_or(NaiveDate::MIN);
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    write_event(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_event(&mut writer, Event::Start(
        BytesStart::new("tv").with_attributes([("generator-info-name", GENERATOR_NAME)]),
    ))?;

    for list in epg {
        write_event(&mut writer, Event::Start(
            BytesStart::new("channel").with_attributes([("id", list.channel_id.as_str())]),
        ))?;
        write_event(&mut writer, Event::Start(BytesStart::new("display-name").with_attributes([("lang", "zh")])))?;
        write_event(&mut writer, Event::Text(BytesText::new(&list.channel_name)))?;
        write_event(&mut writer, Event::End(BytesEnd::new("display-name")))?;
        write_event(&mut writer, Event::End(BytesEnd::new("channel")))?;
    }

    for list in epg {
        for day in &list.dates {
            if back_days > 0 && day.date < oldest {
                continue;
            }
            for program in &day.programs {
                let start = xmltv_time(&program.begin_time, tz);
                let stop = xmltv_time(&program.end_time, tz);
                write_event(&mut writer, Event::Start(BytesStart::new("programme").with_attributes([
                    ("start", start.as_str()),
                    ("stop", stop.as_str()),
                    ("channel", list.channel_id.as_str()),
                ])))?;
                write_event(&mut writer, Event::Start(BytesStart::new("title").with_attributes([("lang", "zh")])))?;
                write_event(&mut writer, Event::Text(BytesText::new(&program.name)))?;
                write_event(&mut writer, Event::End(BytesEnd::new("title")))?;
                write_event(&mut writer, Event::End(BytesEnd::new("programme")))?;
            }
        }
    }

    write_event(&mut writer, Event::End(BytesEnd::new("tv")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> anyhow::Result<()> {
    writer.write_event(event)?;
    Ok(())
}

/// `YYYYMMDDhhmmss +zzzz` in the guide's timezone.
fn xmltv_time(timestamp: &str, tz: &Tz) -> String {
    let offset = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .ok()
        .and_then(|naive| crate::epg::local(tz, naive).ok())
        .map(|t| t.format("%z").to_string())
        .unwrap_or_else(|| "+0000".to_string());
    format!("{timestamp} {offset}")
}
