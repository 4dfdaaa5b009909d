use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tower::util::ServiceExt;
use url::Url;

use iptv_relay::channels::Channel;
use iptv_relay::clock::ManualClock;
use iptv_relay::config::ServerConfig;
use iptv_relay::epg::{ChannelProgramList, DateProgram, Program};
use iptv_relay::store::Store;

fn shanghai() -> Tz {
    "Asia/Shanghai".parse().unwrap()
}

fn channel(id: &str, name: &str, group: &str, urls: &[&str], catchup: Option<&str>) -> Channel {
    Channel {
        id: id.to_string(),
        name: name.to_string(),
        user_channel_id: id.to_string(),
        urls: urls.iter().map(|u| Url::parse(u).unwrap()).collect(),
        time_shift: catchup.is_some(),
        time_shift_minutes: if catchup.is_some() { 4320 } else { 0 },
        time_shift_url: catchup.map(|u| Url::parse(u).unwrap()),
        group: group.to_string(),
        logo: name.to_string(),
    }
}

fn program(name: &str, begin: &str, end: &str) -> Program {
    Program {
        name: name.to_string(),
        begin_time: begin.to_string(),
        end_time: end.to_string(),
        display_start: format!("{}:{}", &begin[8..10], &begin[10..12]),
        display_end: format!("{}:{}", &end[8..10], &end[10..12]),
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn populated_store() -> Arc<Store> {
    let store = Arc::new(Store::new());
    let at = Utc.with_ymd_and_hms(2024, 11, 30, 4, 0, 0).unwrap();
    store.publish_channels(
        vec![
            channel(
                "100",
                "CCTV-1",
                "央视",
                &["igmp://239.1.1.1:1234", "rtsp://10.0.0.9/live/100"],
                Some("http://10.0.0.9/catchup/100"),
            ),
            channel("200", "Local News", "Other", &["rtsp://10.0.0.9/live/200"], None),
        ],
        at,
    );
    store.publish_epg(
        vec![ChannelProgramList {
            channel_id: "100".to_string(),
            channel_name: "CCTV-1".to_string(),
            dates: vec![
                DateProgram {
                    date: date(2024, 11, 28),
                    programs: vec![program("Old News", "20241128190000", "20241128193000")],
                },
                DateProgram {
                    date: date(2024, 11, 30),
                    programs: vec![
                        program("News", "20241130190000", "20241130193000"),
                        program("Weather", "20241130193000", "20241130194000"),
                    ],
                },
            ],
        }],
        at,
    );
    store
}

/// The app with "today" fixed at 2024-11-30 in Shanghai.
fn app(store: Arc<Store>) -> Router {
    let server = ServerConfig {
        udpxy_url: Some("http://192.168.1.1:4022".to_string()),
        ..Default::default()
    };
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 11, 30, 4, 0, 0).unwrap()));
    iptv_relay::create_app_with_clock(store, server, shanghai(), clock)
}

async fn get(app: Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = http_body_util::BodyExt::collect(response.into_body()).await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_channels_api() {
    let (status, body) = get(app(populated_store()), "/api/channels").await;
    assert_eq!(status, StatusCode::OK);

    let channels: Vec<Channel> = serde_json::from_str(&body).unwrap();
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0].name, "CCTV-1");
    assert_eq!(channels[1].group, "Other");
}

#[tokio::test]
async fn test_playlists_unavailable_before_first_refresh() {
    let store = Arc::new(Store::new());
    let (status, _) = get(app(Arc::clone(&store)), "/channel/m3u").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(app(store), "/channel/txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_m3u_playlist() {
    let (status, body) = get(app(populated_store()), "/channel/m3u").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("#EXTM3U\n"));
    assert!(body.contains("http://192.168.1.1:4022/rtp/239.1.1.1:1234"));
    assert!(body.contains("catchup-source=\"http://10.0.0.9/catchup/100?playseek=${(b)yyyyMMddHHmmss}-${(e)yyyyMMddHHmmss}\""));
    assert!(body.contains("group-title=\"Other\",Local News\nrtsp://10.0.0.9/live/200"));

    let (_, body) = get(app(populated_store()), "/channel/m3u?multiFirst=false&csFormat=1").await;
    assert!(body.contains("group-title=\"央视\",CCTV-1\nrtsp://10.0.0.9/live/100"));
    assert!(body.contains("?playseek={utc:YmdHMS}-{utcend:YmdHMS}"));
}

#[tokio::test]
async fn test_txt_playlist() {
    let (status, body) = get(app(populated_store()), "/channel/txt").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        "央视,#genre#\nCCTV-1,http://192.168.1.1:4022/rtp/239.1.1.1:1234\n\
         Other,#genre#\nLocal News,rtsp://10.0.0.9/live/200\n"
    );
}

#[tokio::test]
async fn test_json_epg() {
    let (status, _) = get(app(populated_store()), "/epg/json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = get(app(populated_store()), "/epg/json?ch=CCTV-1&date=30-11-2024").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Without a date, today is used.
    let (status, body) = get(app(populated_store()), "/epg/json?ch=CCTV-1").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["channel_name"], "CCTV-1");
    assert_eq!(json["date"], "2024-11-30");
    assert_eq!(json["epg_data"].as_array().unwrap().len(), 2);
    assert_eq!(json["epg_data"][1]["title"], "Weather");
    assert_eq!(json["epg_data"][1]["start"], "19:30");
    assert_eq!(json["epg_data"][1]["end"], "19:40");

    let (status, body) = get(app(populated_store()), "/epg/json?ch=Unknown&date=2024-11-30").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(json["epg_data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_xml_epg() {
    let (status, body) = get(app(populated_store()), "/epg/xml").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#"<channel id="100">"#));
    assert!(body.contains(r#"start="20241128190000 +0800""#));
    assert!(body.contains(r#"start="20241130193000 +0800" stop="20241130194000 +0800""#));

    let (_, body) = get(app(populated_store()), "/epg/xml?backDay=1").await;
    assert!(!body.contains("Old News"));
    assert!(body.contains("Weather"));
}

#[tokio::test]
async fn test_metrics_and_unknown_routes() {
    iptv_relay::metrics::record_refresh("channels", true, 1_732_939_200);
    let (status, body) = get(app(populated_store()), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("iptv_refresh_total"));

    let (status, _) = get(app(populated_store()), "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
