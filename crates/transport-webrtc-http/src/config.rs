use std::env;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "beach-http";
pub const DEFAULT_CHECKING_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// One ICE server entry, shaped like the browser `RTCIceServer` dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Browser-compatible `RTCConfiguration` subset handed out by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfiguration {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl IceConfiguration {
    pub fn stun_default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
        }
    }

    /// Parses a comma separated list of ICE urls, one server per url.
    pub fn from_url_list(list: &str) -> Self {
        let ice_servers = list
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| IceServer {
                urls: vec![url.to_string()],
                ..Default::default()
            })
            .collect();
        Self { ice_servers }
    }

    pub fn to_rtc(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// Configuration for the data-channel HTTP transport
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// ICE servers used when the signaller does not supply any
    pub ice: IceConfiguration,
    pub data_channel_label: String,
    pub ordered: bool,
    /// How long ICE may sit in `checking` before the connection is failed
    pub checking_timeout: Duration,
    /// Exchange the offer with whatever candidates exist after this long
    pub ice_gather_timeout: Option<Duration>,
    pub channel_open_timeout: Duration,
    /// Token stamped into offers and required on every served request
    pub bearer_token: Option<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice: IceConfiguration::stun_default(),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            ordered: true,
            checking_timeout: DEFAULT_CHECKING_TIMEOUT,
            ice_gather_timeout: None,
            channel_open_timeout: DEFAULT_CHANNEL_OPEN_TIMEOUT,
            bearer_token: None,
        }
    }
}

impl WebRtcConfig {
    pub fn from_env() -> Self {
        let ice = if env::var("BEACH_LOCALHOST_ONLY").is_ok() {
            IceConfiguration::default()
        } else {
            env::var("BEACH_ICE_SERVERS")
                .map(|list| IceConfiguration::from_url_list(&list))
                .unwrap_or_else(|_| IceConfiguration::stun_default())
        };
        let ice_gather_timeout = env::var("BEACH_ICE_GATHER_TIMEOUT_MS")
            .ok()
            .and_then(|val| val.parse().ok())
            .map(Duration::from_millis);
        let channel_open_timeout = env::var("BEACH_CHANNEL_OPEN_TIMEOUT_MS")
            .ok()
            .and_then(|val| val.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CHANNEL_OPEN_TIMEOUT);
        let bearer_token = env::var("BEACH_DATACHANNEL_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        Self {
            ice,
            ice_gather_timeout,
            channel_open_timeout,
            bearer_token,
            ..Default::default()
        }
    }

    /// Configuration with no STUN/TURN servers, for same-host peers.
    pub fn localhost() -> Self {
        Self {
            ice: IceConfiguration::default(),
            ..Default::default()
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub(crate) fn setting_engine(&self) -> SettingEngine {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        setting
    }
}
