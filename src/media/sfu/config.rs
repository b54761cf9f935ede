#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers, and transports

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};
use tracing::warn;

const AUDIO_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(48_000) {
    Some(rate) => rate,
    None => panic!("audio clock rate must be non-zero"),
};
const VIDEO_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(90_000) {
    Some(rate) => rate,
    None => panic!("video clock rate must be non-zero"),
};
const STEREO: NonZeroU8 = match NonZeroU8::new(2) {
    Some(channels) => channels,
    None => panic!("channel count must be non-zero"),
};

/// Main media server configuration
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    /// Public address announced in ICE candidates.
    pub announced_address: Option<String>,
    /// Worker `i` listens for WebRTC on UDP/TCP port `base + i`.
    pub webrtc_server_port_base: u16,
    /// dBov floor for the per-room audio level observer.
    pub audio_level_threshold: i8,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            worker_config: WorkerConfig::default(),
            router_config: RouterConfig::default(),
            announced_address: None,
            webrtc_server_port_base: 40000,
            audio_level_threshold: -50,
        }
    }
}

impl MediaConfig {
    /// Reads `MEDIASOUP_WORKERS`, `RTC_MIN_PORT`, `RTC_MAX_PORT`,
    /// `WEBRTC_SERVER_PORT` and `ANNOUNCE_IP`, keeping defaults for the rest.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(workers) = parse_env::<usize>("MEDIASOUP_WORKERS").filter(|n| *n > 0) {
            config.worker_config.num_workers = workers;
        }
        if let Some(port) = parse_env("RTC_MIN_PORT") {
            config.worker_config.rtc_min_port = port;
        }
        if let Some(port) = parse_env("RTC_MAX_PORT") {
            config.worker_config.rtc_max_port = port;
        }
        if let Some(port) = parse_env("WEBRTC_SERVER_PORT") {
            config.webrtc_server_port_base = port;
        }
        if let Some(ip) = parse_env::<IpAddr>("ANNOUNCE_IP") {
            config.announced_address = Some(ip.to_string());
        }
        config
    }

    /// Listen info for worker `index`'s WebRtcServer.
    pub fn webrtc_server_listen_info(&self, index: usize, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: self.announced_address.clone(),
            port: Some(self.webrtc_server_port_base.saturating_add(index as u16)),
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub dtls_certificate_file: Option<String>,
    pub dtls_private_key_file: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;

        if let (Some(cert), Some(key)) = (&self.dtls_certificate_file, &self.dtls_private_key_file) {
            settings.dtls_files = Some(WorkerDtlsFiles {
                certificate: cert.clone().into(),
                private_key: key.clone().into(),
            });
        }

        settings
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    fn video_feedback() -> Vec<RtcpFeedback> {
        vec![
            RtcpFeedback::Nack,
            RtcpFeedback::NackPli,
            RtcpFeedback::CcmFir,
            RtcpFeedback::GoogRemb,
            RtcpFeedback::TransportCc,
        ]
    }

    /// Opus plus VP8, VP9 and H264 (constrained baseline).
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(111),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: STEREO,
                parameters: RtpCodecParametersParameters::from([
                    ("minptime", 10_u32.into()),
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: Some(96),
                clock_rate: VIDEO_CLOCK_RATE,
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: Self::video_feedback(),
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp9,
                preferred_payload_type: Some(98),
                clock_rate: VIDEO_CLOCK_RATE,
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: Self::video_feedback(),
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: Some(102),
                clock_rate: VIDEO_CLOCK_RATE,
                parameters: RtpCodecParametersParameters::from([
                    ("level-asymmetry-allowed", 1_u32.into()),
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", "42e01f".into()),
                ]),
                rtcp_feedback: Self::video_feedback(),
            },
        ]
    }

    /// Converts to RouterOptions for mediasoup
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ports_are_consecutive() {
        let config = MediaConfig {
            announced_address: Some("203.0.113.7".into()),
            ..MediaConfig::default()
        };
        let first = config.webrtc_server_listen_info(0, Protocol::Udp);
        let third = config.webrtc_server_listen_info(2, Protocol::Tcp);
        assert_eq!(first.port, Some(40000));
        assert_eq!(third.port, Some(40002));
        assert_eq!(third.announced_address.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_default_codecs_cover_audio_and_video() {
        let codecs = RouterConfig::default_codecs();
        assert!(matches!(codecs[0], RtpCodecCapability::Audio { .. }));
        assert_eq!(codecs.len(), 4);
    }
}
