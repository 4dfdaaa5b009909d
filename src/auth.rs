use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, REFERER};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sysinfo::Networks;
use tracing::{debug, info};

use crate::client::{host_of, Client};
use crate::config::IptvConfig;
use crate::crypto::TripleDes;
use crate::error::{IptvError, Result};

lazy_static! {
    static ref ENCRYPT_TOKEN_REGEX: Regex = Regex::new(r#"EncryptToken = "(.+?)";"#).unwrap();
    static ref USER_TOKEN_REGEX: Regex =
        Regex::new(r#"(?s)"UserToken" value="(.+?)".+?"stbid" value="(.*?)""#).unwrap();
}

const SESSION_COOKIE: &str = "JSESSIONID";

pub(crate) const AUTH_URL_PATH: &str = "/EDS/jsp/AuthenticationURL";
pub(crate) const AUTH_LOGIN_PATH: &str = "/EPG/jsp/authLoginHWCTC.jsp";
pub(crate) const VALID_AUTH_PATH: &str = "/EPG/jsp/ValidAuthenticationHWCTC.jsp";

/// Session credentials for one acquisition cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub user_token: String,
    pub stb_id: String,
    pub session_id: String,
}

impl Client {
    /// Runs the three-step handshake and returns a fresh session token.
    pub async fn request_token(&mut self) -> Result<Token> {
        let referer = self.authentication_url().await?;
        let encrypt_token = self.auth_login(&referer).await?;
        let token = self.valid_authentication(&encrypt_token).await?;
        info!("Authenticated against {} (stbid={})", self.host(), token.stb_id);
        Ok(token)
    }

    /// Step 1: discover the serving host. The response may come from a host other
    /// than the configured one after redirects; that host is kept for the session.
    async fn authentication_url(&mut self) -> Result<String> {
        let url = format!("http://{}{}", self.origin_host(), AUTH_URL_PATH);
        let req = self.request(Method::GET, &url).query(&[
            ("UserID", self.config.user_id.as_str()),
            ("Action", "Login"),
            ("FCCSupport", "1"),
        ]);
        let resp = self.send_ok(req).await?;
        let final_url = resp.url().clone();
        let host = host_of(&final_url)
            .ok_or_else(|| IptvError::Auth(format!("no host in redirect target {final_url}")))?;
        self.set_host(host);
        Ok(final_url.to_string())
    }

    /// Step 2: fetch the login page and pull out `EncryptToken`.
    async fn auth_login(&self, referer: &str) -> Result<String> {
        let req = self
            .request(Method::POST, &self.url(AUTH_LOGIN_PATH))
            .header(REFERER, referer)
            .form(&[
                ("UserID", self.config.user_id.as_str()),
                ("VIP", self.config.vip.as_str()),
            ]);
        let resp = self.send_ok(req).await?;
        let body = self.text(resp).await?;
        parse_encrypt_token(&body)
    }

    /// Step 3: post the Authenticator and collect `UserToken`, `stbid` and the session cookie.
    async fn valid_authentication(&self, encrypt_token: &str) -> Result<Token> {
        let ip = match self.config.interface_name.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => interface_ipv4(name)?,
            None => self.config.ip.clone(),
        };
        let random = rand::thread_rng().gen_range(10_000_000..100_000_000u32);
        let plaintext = authenticator_input(random, encrypt_token, &self.config, &ip);
        let authenticator = TripleDes::new(&self.config.key)
            .encrypt(&plaintext)
            .to_uppercase();
        debug!("Authenticator built for user={} ip={}", self.config.user_id, ip);

        let c = &self.config;
        let form = [
            ("UserID", c.user_id.as_str()),
            ("Lang", c.lang.as_str()),
            ("SupportHD", "1"),
            ("NetUserID", c.net_user_id.as_str()),
            ("Authenticator", authenticator.as_str()),
            ("STBType", c.stb_type.as_str()),
            ("STBVersion", c.stb_version.as_str()),
            ("conntype", c.conntype.as_str()),
            ("STBID", c.stb_id.as_str()),
            ("templateName", c.template_name.as_str()),
            ("areaId", c.area_id.as_str()),
            ("userToken", encrypt_token),
            ("userGroupId", c.user_group_id.as_str()),
            ("productPackageId", c.product_package_id.as_str()),
            ("mac", c.mac.as_str()),
            ("UserField", c.user_field.as_str()),
            ("SoftwareVersion", c.software_version.as_str()),
            ("IsSmartStb", c.is_smart_stb.as_str()),
            ("desktopId", ""),
            ("stbmaker", ""),
            ("XMPPCapability", ""),
            ("ChipID", ""),
            ("VIP", c.vip.as_str()),
        ];
        let req = self
            .request(Method::POST, &self.url(VALID_AUTH_PATH))
            .header(REFERER, self.url(AUTH_LOGIN_PATH))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&form);
        let resp = self.send_ok(req).await?;

        let session_id = resp
            .cookies()
            .find(|cookie| cookie.name() == SESSION_COOKIE && !cookie.value().is_empty())
            .map(|cookie| cookie.value().to_string())
            .ok_or_else(|| IptvError::Auth(format!("no {SESSION_COOKIE} cookie in response")))?;

        let body = self.text(resp).await?;
        let (user_token, stb_id) = parse_user_token(&body)?;
        Ok(Token {
            user_token,
            stb_id,
            session_id,
        })
    }
}

/// `random$EncryptToken$UserID$STBID$IP$MAC$Reserved$CTC`, reserved left empty.
pub fn authenticator_input(random: u32, encrypt_token: &str, config: &IptvConfig, ip: &str) -> String {
    format!(
        "{random}${encrypt_token}${}${}${ip}${}$$CTC",
        config.user_id, config.stb_id, config.mac
    )
}

pub fn parse_encrypt_token(html: &str) -> Result<String> {
    let mut matches = ENCRYPT_TOKEN_REGEX.captures_iter(html);
    match (matches.next(), matches.next()) {
        (Some(caps), None) => Ok(caps[1].to_string()),
        (None, _) => Err(IptvError::Parse("EncryptToken not found".to_string())),
        (Some(_), Some(_)) => Err(IptvError::Parse("EncryptToken is ambiguous".to_string())),
    }
}

pub fn parse_user_token(html: &str) -> Result<(String, String)> {
    let mut matches = USER_TOKEN_REGEX.captures_iter(html);
    match (matches.next(), matches.next()) {
        (Some(caps), None) => Ok((caps[1].to_string(), caps[2].to_string())),
        (None, _) => Err(IptvError::Parse("UserToken not found".to_string())),
        (Some(_), Some(_)) => Err(IptvError::Parse("UserToken is ambiguous".to_string())),
    }
}

fn interface_ipv4(name: &str) -> Result<String> {
    let networks = Networks::new_with_refreshed_list();
    let data = networks
        .list()
        .get(name)
        .ok_or_else(|| IptvError::Config(format!("network interface {name} not found")))?;
    let ip = data
        .ip_networks()
        .iter()
        .map(|net| net.addr)
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| IptvError::Config(format!("network interface {name} has no IPv4 address")))?;
    info!("Using network interface {}, IPv4 address: {}", name, ip);
    Ok(ip.to_string())
}
