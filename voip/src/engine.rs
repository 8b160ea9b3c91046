use std::net::UdpSocket;
use std::time::Instant;

use log::{debug, info, warn};
use rtp_audio::{Codec, GainStage, RtpStats, RtpStream};
use sip_core::{CallState, CallStateMachine, CoreEvent, MediaParams, RegistrationState, SipStats};

use crate::{
    audio::{AudioFrame, AudioIoError, AudioTransport, Direction},
    config::RegistrationConfig,
    error::{TransportError, VoipError},
    events::EventSink,
    net::{bind_udp, DatagramSocket, RX_BUF_SIZE},
};

/// SIP datagrams handled per tick before yielding to the audio pump.
const MAX_SIP_PER_TICK: usize = 32;
/// RTP datagrams drained per tick; anything beyond waits for the next one.
const MAX_MEDIA_PER_TICK: usize = 16;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub mic_underruns: u64,
    pub speaker_overruns: u64,
    pub speaker_errors: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    /// Media datagrams that arrived with no call to deliver them to.
    pub media_without_call: u64,
    pub frames_sent: u64,
    pub frames_played: u64,
}

/// Composition root: one signalling state machine, at most one media stream,
/// both gain stages and the host seams. Everything runs inside [`tick`].
///
/// [`tick`]: VoipEngine::tick
pub struct VoipEngine<S, A, E> {
    config: RegistrationConfig,
    sip: CallStateMachine,
    sip_socket: S,
    media_socket: S,
    audio: A,
    events: E,
    stream: Option<RtpStream>,
    last_rtp_stats: Option<RtpStats>,
    mic_gain: GainStage,
    amp_gain: GainStage,
    next_frame: Option<Instant>,
    boot_pending: bool,
    stats: EngineStats,
    buf: [u8; RX_BUF_SIZE],
}

impl<A, E> VoipEngine<UdpSocket, A, E>
where
    A: AudioTransport,
    E: EventSink,
{
    /// Bind the SIP and RTP sockets on the configured local address.
    pub fn bind(config: RegistrationConfig, audio: A, events: E) -> Result<Self, VoipError> {
        let sip_socket = bind_udp(config.sip_local())?;
        let media_socket = bind_udp(config.rtp_local())?;
        Ok(Self::new(config, sip_socket, media_socket, audio, events))
    }
}

impl<S, A, E> VoipEngine<S, A, E>
where
    S: DatagramSocket,
    A: AudioTransport,
    E: EventSink,
{
    pub fn new(config: RegistrationConfig, sip_socket: S, media_socket: S, audio: A, events: E) -> Self {
        let gain = config.gain();
        info!(
            "voip engine for {}@{} (codec {}, start_on_boot={})",
            config.user(),
            config.sip_server(),
            config.codec().name(),
            config.start_on_boot()
        );
        Self {
            sip: CallStateMachine::new(config.sip_config()),
            sip_socket,
            media_socket,
            audio,
            events,
            stream: None,
            last_rtp_stats: None,
            mic_gain: gain.mic.stage(),
            amp_gain: gain.amp.stage(),
            next_frame: None,
            boot_pending: config.start_on_boot(),
            stats: EngineStats::default(),
            buf: [0u8; RX_BUF_SIZE],
            config,
        }
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    pub fn state(&self) -> CallState {
        self.sip.state()
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.sip.registration_state()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn sip_stats(&self) -> SipStats {
        self.sip.stats()
    }

    /// Media counters of the current call, or of the last one once it ended.
    pub fn rtp_stats(&self) -> Option<RtpStats> {
        self.stream.as_ref().map(|s| *s.stats()).or(self.last_rtp_stats)
    }

    pub fn audio(&self) -> &A {
        &self.audio
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        self.boot_pending = false;
        let events = self.sip.start(now);
        self.dispatch(events);
    }

    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    pub fn stop_at(&mut self, now: Instant) {
        self.boot_pending = false;
        let events = self.sip.stop(now);
        self.dispatch(events);
    }

    pub fn dial(&mut self, target: &str, display_name: Option<&str>) -> Result<(), VoipError> {
        self.dial_at(target, display_name, Instant::now())
    }

    pub fn dial_at(&mut self, target: &str, display_name: Option<&str>, now: Instant) -> Result<(), VoipError> {
        let events = self.sip.dial(target, display_name, now)?;
        self.dispatch(events);
        Ok(())
    }

    pub fn answer(&mut self) -> Result<(), VoipError> {
        self.answer_at(Instant::now())
    }

    pub fn answer_at(&mut self, now: Instant) -> Result<(), VoipError> {
        let events = self.sip.answer(now)?;
        self.dispatch(events);
        Ok(())
    }

    pub fn hangup(&mut self) {
        self.hangup_at(Instant::now());
    }

    pub fn hangup_at(&mut self, now: Instant) {
        let events = self.sip.hangup(now);
        self.dispatch(events);
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Timers, one drain of the SIP socket, then one pass of the audio pump.
    pub fn tick_at(&mut self, now: Instant) {
        if self.boot_pending {
            info!("starting registration on boot");
            self.start_at(now);
        }

        let events = self.sip.poll(now);
        self.dispatch(events);

        self.drain_sip(now);
        self.pump_audio(now);
    }

    fn drain_sip(&mut self, now: Instant) {
        for _ in 0..MAX_SIP_PER_TICK {
            let (len, from) = match self.sip_socket.recv_from(&mut self.buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    self.stats.receive_errors += 1;
                    warn!("{}", TransportError::Receive(e));
                    break;
                }
            };
            let events = self.sip.on_datagram(&self.buf[..len], from, now);
            self.dispatch(events);
        }
    }

    fn pump_audio(&mut self, now: Instant) {
        self.drain_media();

        let Some(stream) = self.stream.as_mut() else {
            self.next_frame = None;
            return;
        };
        if self.next_frame.is_some_and(|t| now < t) {
            return;
        }
        let frame_duration = self.config.audio().frame_duration();
        let mut next = self.next_frame.unwrap_or(now);
        while next <= now {
            next += frame_duration;
        }
        self.next_frame = Some(next);

        // Capture.
        let frame_samples = self.config.audio().frame_samples;
        let mut mic = match self.audio.read_mic_frame() {
            Some(frame) => frame,
            None => {
                self.stats.mic_underruns += 1;
                AudioFrame::silence(Direction::Capture, frame_samples)
            }
        };
        self.mic_gain.apply(&mut mic.samples);
        match stream.packetize(&mic.samples) {
            Ok(packet) => {
                let dest = stream.remote();
                match self.media_socket.send_to(&packet, dest) {
                    Ok(_) => self.stats.frames_sent += 1,
                    Err(source) => {
                        self.stats.send_errors += 1;
                        warn!("{}", TransportError::Send { dest, source });
                    }
                }
            }
            Err(e) => warn!("rtp: cannot packetize mic frame: {}", e),
        }

        // Playback.
        let (samples, real) = stream.playout();
        let mut speaker = AudioFrame {
            direction: Direction::Playback,
            samples,
        };
        if real {
            self.amp_gain.apply(&mut speaker.samples);
        }
        match self.audio.write_speaker_frame(&speaker) {
            Ok(()) => self.stats.frames_played += 1,
            Err(AudioIoError::Overrun) => self.stats.speaker_overruns += 1,
            Err(e) => {
                self.stats.speaker_errors += 1;
                warn!("speaker: {}", e);
            }
        }
    }

    fn drain_media(&mut self) {
        for _ in 0..MAX_MEDIA_PER_TICK {
            let (len, from) = match self.media_socket.recv_from(&mut self.buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    self.stats.receive_errors += 1;
                    warn!("{}", TransportError::Receive(e));
                    break;
                }
            };
            match self.stream.as_mut() {
                Some(stream) => {
                    if let Err(e) = stream.receive_from(from, &self.buf[..len]) {
                        debug!("rtp: dropped datagram from {}: {}", from, e);
                    }
                }
                None => self.stats.media_without_call += 1,
            }
        }
    }

    fn dispatch(&mut self, events: Vec<CoreEvent>) {
        for event in events {
            match event {
                CoreEvent::Send { dest, payload } => {
                    debug!("sip -> {}:\n{}", dest, payload);
                    if let Err(source) = self.sip_socket.send_to(payload.as_bytes(), dest) {
                        self.stats.send_errors += 1;
                        warn!("{}", TransportError::Send { dest, source });
                    }
                }
                CoreEvent::Lifecycle(event) => {
                    info!("lifecycle: {:?}", event);
                    self.events.emit(event);
                }
                CoreEvent::MediaStart(params) => self.start_media(params),
                CoreEvent::MediaStop => self.stop_media(),
            }
        }
    }

    fn start_media(&mut self, params: MediaParams) {
        let Some(codec) = Codec::from_payload_type(params.payload_type) else {
            warn!("rtp: no codec for payload type {}", params.payload_type);
            return;
        };
        let ssrc = rand::random::<u32>();
        info!(
            "rtp: start {} to {} (ssrc {:#010x})",
            codec.name(),
            params.remote,
            ssrc
        );
        self.stream = Some(RtpStream::new(
            codec,
            params.remote,
            ssrc,
            self.config.audio().frame_samples,
        ));
        self.next_frame = None;
        self.audio.start();
    }

    fn stop_media(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let stats = *stream.stats();
        info!(
            "rtp: stopped; sent {} received {} lost {} reordered {} duplicate {} stale {}",
            stats.packets_sent,
            stats.packets_received,
            stats.lost,
            stats.reordered,
            stats.duplicates,
            stats.stale
        );
        self.last_rtp_stats = Some(stats);
        self.next_frame = None;
        self.audio.stop();
    }
}
