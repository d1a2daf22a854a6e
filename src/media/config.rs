#![forbid(unsafe_code)]

// Fixed configuration for the media worker, routers, transports, and the
// audio-level observer.

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU16, NonZeroU32, NonZeroU8};

/// Top-level media configuration.
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub transport: TransportConfig,
    pub audio_observer: AudioObserverConfig,
}

/// Settings for the single global worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
            ],
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup `WorkerSettings`.
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }
}

/// Router codec capabilities: Opus audio and VP8 video, nothing else.
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
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
        ]
    }

    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport settings: UDP and TCP enabled, UDP preferred.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_ip: IpAddr,
    /// Address written into ICE candidates handed to clients.
    pub announced_ip: IpAddr,
    pub initial_available_outgoing_bitrate: u32,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            initial_available_outgoing_bitrate: 800_000,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

impl TransportConfig {
    /// Sets the announced address clients will receive in ICE candidates.
    pub fn with_announced_ip(mut self, announced_ip: IpAddr) -> Self {
        self.announced_ip = announced_ip;
        self
    }

    /// Converts to `WebRtcTransportOptions`; each transport draws its own
    /// port from the worker's RTC port range.
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: self.listen_ip,
            announced_address: Some(self.announced_ip.to_string()),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };

        let mut options =
            WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(listen_info));
        options.enable_udp = self.enable_udp;
        options.enable_tcp = self.enable_tcp;
        options.prefer_udp = self.prefer_udp;
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}

/// Audio-level observer cadence and threshold.
#[derive(Debug, Clone)]
pub struct AudioObserverConfig {
    /// Reporting interval in milliseconds.
    pub interval: u16,
    /// Producers quieter than this (dBvo) are not reported.
    pub threshold: i8,
    /// Number of loudest producers per report.
    pub max_entries: NonZeroU16,
}

impl Default for AudioObserverConfig {
    fn default() -> Self {
        Self {
            interval: 800,
            threshold: -80,
            max_entries: NonZeroU16::new(1).unwrap(),
        }
    }
}
