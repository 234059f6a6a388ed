//! Media transport backed by `webrtc` peer connections.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::stats::StatsReportType;
use webrtc::track::track_remote::TrackRemote;

use crate::codec::OpusDecoder;
use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::error::{Error, Result};
use crate::media::{LocalStream, LocalTrack, PcmTap, RemoteStream, RemoteTrack, TrackKind};
use crate::metrics::{EncodingProfile, StatEntry, StatsSnapshot};
use crate::transport::{
    IceCandidate, MediaTransport, SdpKind, SessionDescription, SignalingState, TransportFactory,
    TransportHandlers,
};

/// Builds one [`WebRtcTransport`] per remote peer.
pub struct WebRtcTransportFactory {
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        local: Option<&LocalStream>,
        handlers: TransportHandlers,
    ) -> Result<Arc<dyn MediaTransport>> {
        let transport = WebRtcTransport::new(&self.ice_servers, local, handlers).await?;
        Ok(Arc::new(transport))
    }
}

pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Option<Arc<RTCRtpSender>>,
    connection_monitor: ConnectionMonitor,
    encoding: watch::Sender<Option<EncodingProfile>>,
}

impl WebRtcTransport {
    pub async fn new(
        ice_servers: &[String],
        local: Option<&LocalStream>,
        handlers: TransportHandlers,
    ) -> Result<Self> {
        let connection_monitor = ConnectionMonitor::new();

        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // NACK, RTCP reports and TWCC; the stats report depends on them
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        // Local tracks are bound once; later changes go through replace_video_track
        let mut sending_audio = false;
        let mut video_sender = None;
        for track in local.map(LocalStream::tracks).unwrap_or_default() {
            let sender = peer_connection.add_track(track.handle()).await?;
            match track.kind() {
                TrackKind::Audio => sending_audio = true,
                TrackKind::Video => video_sender = Some(Arc::clone(&sender)),
            }
            Self::drain_rtcp(sender);
        }

        // Always ask for both kinds from the remote side
        if !sending_audio {
            Self::add_receiver(&peer_connection, RTPCodecType::Audio).await?;
        }
        if video_sender.is_none() {
            Self::add_receiver(&peer_connection, RTPCodecType::Video).await?;
        }

        Self::register_track_handler(&peer_connection, handlers.clone());
        Self::register_candidate_handler(&peer_connection, handlers);

        let monitor = connection_monitor.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                debug!(state = %s, "Peer Connection State has changed");
                monitor.update_state(s.into());
                Box::pin(async {})
            },
        ));

        let (encoding, _) = watch::channel(None);
        Ok(Self {
            peer_connection,
            video_sender,
            connection_monitor,
            encoding,
        })
    }

    /// Encoding limits last chosen for this session; the encoder feeding the
    /// outgoing sample track follows them.
    pub fn encoding(&self) -> watch::Receiver<Option<EncodingProfile>> {
        self.encoding.subscribe()
    }

    async fn add_receiver(peer_connection: &RTCPeerConnection, kind: RTPCodecType) -> Result<()> {
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        peer_connection
            .add_transceiver_from_kind(kind, Some(init))
            .await?;
        Ok(())
    }

    /// Reads incoming RTCP so interceptors see receiver reports.
    fn drain_rtcp(sender: Arc<RTCRtpSender>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
    }

    fn register_track_handler(peer_connection: &RTCPeerConnection, handlers: TransportHandlers) {
        // Tracks of one remote stream arrive separately; collect them by stream id
        let streams: Arc<Mutex<HashMap<String, RemoteStream>>> = Arc::new(Mutex::new(HashMap::new()));

        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let remote = RemoteTrack::new(track.id(), track.kind().into());
                let stream_id = track.stream_id();
                let stream = {
                    let mut streams = streams.lock();
                    let stream = streams
                        .entry(stream_id.clone())
                        .or_insert_with(|| RemoteStream::new(stream_id, Vec::new()));
                    stream.add_track(remote.clone());
                    stream.clone()
                };
                debug!(track_id = remote.id(), stream_id = stream.id(), "Remote track arrived");
                (handlers.on_track)(stream);

                let on_ended = Arc::clone(&handlers.on_track_ended);
                Box::pin(async move {
                    // Keep the read loop off the handler so later tracks are not blocked
                    tokio::spawn(async move {
                        let mut decoder = Self::audio_decoder(&track, &remote);
                        let mut buf = vec![0u8; 1500];
                        while let Ok((packet, _)) = track.read(&mut buf).await {
                            if let (Some(decoder), Some(tap)) = (decoder.as_mut(), remote.pcm()) {
                                feed_tap(decoder, &packet.payload, tap);
                            }
                        }
                        debug!(track_id = remote.id(), "Remote track ended");
                        remote.end();
                        on_ended();
                    });
                })
            },
        ));
    }

    /// Opus audio tracks get a decoder feeding their PCM tap; other tracks are only drained.
    fn audio_decoder(track: &TrackRemote, remote: &RemoteTrack) -> Option<OpusDecoder> {
        remote.pcm()?;
        let mime_type = track.codec().capability.mime_type;
        if !mime_type.eq_ignore_ascii_case("audio/opus") {
            debug!(
                track_id = remote.id(),
                mime_type = %mime_type,
                "No decoder for remote audio codec"
            );
            return None;
        }
        match OpusDecoder::new() {
            Ok(decoder) => Some(decoder),
            Err(e) => {
                warn!(track_id = remote.id(), error = %e, "Remote audio will not be analysed");
                None
            }
        }
    }

    fn register_candidate_handler(peer_connection: &RTCPeerConnection, handlers: TransportHandlers) {
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate.map(|c| c.to_json()) {
                Some(Ok(init)) => (handlers.on_ice_candidate)(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                }),
                Some(Err(e)) => warn!(error = %e, "Failed to serialize ICE candidate"),
                None => debug!("ICE candidate gathering complete"),
            }
            Box::pin(async {})
        }));
    }

    fn to_native(desc: SessionDescription) -> Result<RTCSessionDescription> {
        let native = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
            SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
            SdpKind::Rollback => {
                return Err(Error::Negotiation("rollback is not supported".into()))
            }
        };
        Ok(native)
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn feed_tap(decoder: &mut OpusDecoder, payload: &[u8], tap: &PcmTap) {
    if payload.is_empty() {
        return;
    }
    if let Err(e) = decoder.decode_into(payload, tap) {
        trace!(error = %e, "Dropping undecodable audio packet");
    }
}

/// webrtc-rs reports 0 until a STUN round trip has been measured.
fn round_trip_time(seconds: f64) -> Option<f64> {
    (seconds > 0.0).then_some(seconds)
}

fn stat_entry(stat: StatsReportType, now: Instant) -> Option<StatEntry> {
    match stat {
        StatsReportType::OutboundRTP(s) if s.kind == "video" => Some(StatEntry::OutboundVideo {
            id: s.id,
            bytes_sent: s.bytes_sent,
            timestamp: now,
        }),
        StatsReportType::RemoteInboundRTP(s) if s.kind == "video" => Some(StatEntry::InboundVideo {
            id: s.id,
            packets_lost: s.packets_lost,
        }),
        StatsReportType::CandidatePair(s) => Some(StatEntry::CandidatePair {
            succeeded: matches!(s.state, CandidatePairState::Succeeded),
            current_round_trip_time: round_trip_time(s.current_round_trip_time),
        }),
        _ => None,
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(Self::to_native(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(Self::to_native(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.peer_connection.signaling_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_monitor.subscribe()
    }

    async fn stats(&self) -> Result<StatsSnapshot> {
        let report = self.peer_connection.get_stats().await;
        let now = Instant::now();
        let entries = report
            .reports
            .into_values()
            .filter_map(|stat| stat_entry(stat, now))
            .collect();
        Ok(StatsSnapshot { entries })
    }

    async fn has_video_sender(&self) -> bool {
        match &self.video_sender {
            Some(sender) => sender.track().await.is_some(),
            None => false,
        }
    }

    async fn apply_encoding(&self, profile: EncodingProfile) -> Result<()> {
        debug!(
            max_bitrate = profile.max_bitrate,
            scale_down_by = profile.scale_down_by,
            max_framerate = profile.max_framerate,
            "Encoding parameters updated"
        );
        self.encoding.send_replace(Some(profile));
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<LocalTrack>) -> Result<()> {
        let Some(sender) = &self.video_sender else {
            debug!("No video sender, track replacement skipped");
            return Ok(());
        };
        sender.replace_track(track.map(|t| t.handle())).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        self.connection_monitor.update_state(ConnectionState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handlers() -> TransportHandlers {
        TransportHandlers {
            on_track: Arc::new(|_: RemoteStream| {}),
            on_track_ended: Arc::new(|| {}),
            on_ice_candidate: Arc::new(|_: IceCandidate| {}),
        }
    }

    #[tokio::test]
    async fn offer_requests_audio_and_video() {
        let transport = WebRtcTransport::new(&[], None, handlers()).await.unwrap();
        let offer = transport.create_offer().await.unwrap();

        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(!transport.has_video_sender().await);
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn video_sender_follows_replacement() {
        let local = LocalStream::camera("cam");
        let transport = WebRtcTransport::new(&[], Some(&local), handlers())
            .await
            .unwrap();
        assert!(transport.has_video_sender().await);

        transport.replace_video_track(None).await.unwrap();
        assert!(!transport.has_video_sender().await);

        let screen = LocalStream::new(
            "screen",
            vec![LocalTrack::sample(TrackKind::Video, "screen-video", "screen")],
        );
        transport
            .replace_video_track(screen.video_track().cloned())
            .await
            .unwrap();
        assert!(transport.has_video_sender().await);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn encoding_is_published() {
        let transport = WebRtcTransport::new(&[], None, handlers()).await.unwrap();
        let rx = transport.encoding();
        let profile = EncodingProfile {
            max_bitrate: 150_000,
            scale_down_by: 4.0,
            max_framerate: 15.0,
        };
        transport.apply_encoding(profile).await.unwrap();
        assert_eq!(*rx.borrow(), Some(profile));
        transport.close().await.unwrap();
    }

    #[test]
    fn unmeasured_round_trip_is_absent() {
        assert_eq!(round_trip_time(0.0), None);
        assert_eq!(round_trip_time(0.042), Some(0.042));
    }

    /// 20 ms Opus frames of a 440 Hz tone.
    fn tone_packets(frames: usize) -> Vec<Vec<u8>> {
        let mut encoder = opus::Encoder::new(
            crate::codec::OPUS_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .unwrap();
        (0..frames)
            .map(|n| {
                let pcm: Vec<f32> = (0..960)
                    .map(|i| {
                        let t = (n * 960 + i) as f32 / 48_000.0;
                        0.5 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
                    })
                    .collect();
                let mut packet = vec![0u8; 4000];
                let len = encoder.encode_float(&pcm, &mut packet).unwrap();
                packet.truncate(len);
                packet
            })
            .collect()
    }

    #[tokio::test]
    async fn remote_opus_audio_reaches_pcm_tap() {
        use tokio::sync::mpsc;
        use webrtc::media::Sample;
        use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
        use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

        let mic = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                ..Default::default()
            },
            "mic-audio".to_owned(),
            "mic".to_owned(),
        ));
        let local = LocalStream::new("mic", vec![LocalTrack::new(mic.clone())]);

        let (sender_ice_tx, mut sender_ice) = mpsc::unbounded_channel();
        let sender = Arc::new(
            WebRtcTransport::new(
                &[],
                Some(&local),
                TransportHandlers {
                    on_ice_candidate: Arc::new(move |c: IceCandidate| {
                        let _ = sender_ice_tx.send(c);
                    }),
                    ..handlers()
                },
            )
            .await
            .unwrap(),
        );

        let (tap_tx, mut taps) = mpsc::unbounded_channel();
        let (receiver_ice_tx, mut receiver_ice) = mpsc::unbounded_channel();
        let receiver = Arc::new(
            WebRtcTransport::new(
                &[],
                None,
                TransportHandlers {
                    on_track: Arc::new(move |stream: RemoteStream| {
                        if let Some(tap) = stream.audio_tap() {
                            let _ = tap_tx.send(tap);
                        }
                    }),
                    on_ice_candidate: Arc::new(move |c: IceCandidate| {
                        let _ = receiver_ice_tx.send(c);
                    }),
                    ..handlers()
                },
            )
            .await
            .unwrap(),
        );

        let offer = sender.create_offer().await.unwrap();
        sender.set_local_description(offer.clone()).await.unwrap();
        receiver.set_remote_description(offer).await.unwrap();
        let answer = receiver.create_answer().await.unwrap();
        receiver.set_local_description(answer.clone()).await.unwrap();
        sender.set_remote_description(answer).await.unwrap();

        // Both sides have remote descriptions now, so trickled candidates apply
        let to_receiver = Arc::clone(&receiver);
        tokio::spawn(async move {
            while let Some(c) = sender_ice.recv().await {
                let _ = to_receiver.add_ice_candidate(c).await;
            }
        });
        let to_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            while let Some(c) = receiver_ice.recv().await {
                let _ = to_sender.add_ice_candidate(c).await;
            }
        });

        let writer = tokio::spawn(async move {
            for packet in tone_packets(50).into_iter().cycle() {
                let sample = Sample {
                    data: packet.into(),
                    duration: std::time::Duration::from_millis(20),
                    ..Default::default()
                };
                if mic.write_sample(&sample).await.is_err() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        });

        let heard = tokio::time::timeout(std::time::Duration::from_secs(15), async {
            let tap = taps.recv().await.unwrap();
            let mut window = Vec::new();
            loop {
                tap.snapshot(&mut window);
                if window.iter().map(|s| s * s).sum::<f32>() > 1.0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
        .await;

        writer.abort();
        sender.close().await.unwrap();
        receiver.close().await.unwrap();
        assert!(heard.is_ok(), "no decoded audio reached the remote tap");
    }

    #[tokio::test]
    async fn close_reports_closed() {
        let transport = WebRtcTransport::new(&[], None, handlers()).await.unwrap();
        let rx = transport.connection_state();
        transport.close().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Closed);
    }
}
