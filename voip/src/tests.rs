//! Engine scenarios against in-memory sockets, audio and a scripted server.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rtp_audio::{Codec, RtpPacket, RtpSession, RtpStream, MAX_PAYLOAD};
use sip_core::dialog::{attach_body, base_request, build_response};
use sip_core::{parse_message, Message, Method, Request, Response, SipError, MAX_MESSAGE_LEN};

use crate::*;

const SERVER: &str = "192.0.2.1:5060";
const PEER_MEDIA: &str = "192.0.2.9:7078";

fn server() -> SocketAddr {
    SERVER.parse().unwrap()
}

fn peer_media() -> SocketAddr {
    PEER_MEDIA.parse().unwrap()
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[derive(Debug, Default)]
struct Wire {
    inbox: VecDeque<(Vec<u8>, SocketAddr)>,
    sent: Vec<(Vec<u8>, SocketAddr)>,
    fail_sends: bool,
}

#[derive(Debug, Clone, Default)]
struct MockSocket(Arc<Mutex<Wire>>);

impl MockSocket {
    fn inject(&self, data: &[u8], from: SocketAddr) {
        self.0.lock().unwrap().inbox.push_back((data.to_vec(), from));
    }

    fn take_sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut self.0.lock().unwrap().sent)
    }

    fn fail_sends(&self, fail: bool) {
        self.0.lock().unwrap().fail_sends = fail;
    }
}

impl DatagramSocket for MockSocket {
    fn send_to(&mut self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let mut wire = self.0.lock().unwrap();
        if wire.fail_sends {
            return Err(io::Error::new(io::ErrorKind::Other, "network unreachable"));
        }
        wire.sent.push((buf.to_vec(), dest));
        Ok(buf.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((data, from)) = self.0.lock().unwrap().inbox.pop_front() else {
            return Ok(None);
        };
        buf[..data.len()].copy_from_slice(&data);
        Ok(Some((data.len(), from)))
    }
}

#[derive(Debug, Default)]
struct AudioLog {
    mic: VecDeque<AudioFrame>,
    speaker: Vec<AudioFrame>,
    speaker_full: bool,
    starts: u32,
    stops: u32,
}

#[derive(Debug, Clone, Default)]
struct MockAudio(Arc<Mutex<AudioLog>>);

impl AudioTransport for MockAudio {
    fn read_mic_frame(&mut self) -> Option<AudioFrame> {
        self.0.lock().unwrap().mic.pop_front()
    }

    fn write_speaker_frame(&mut self, frame: &AudioFrame) -> Result<(), AudioIoError> {
        let mut log = self.0.lock().unwrap();
        if log.speaker_full {
            return Err(AudioIoError::Overrun);
        }
        log.speaker.push(frame.clone());
        Ok(())
    }

    fn start(&mut self) {
        self.0.lock().unwrap().starts += 1;
    }

    fn stop(&mut self) {
        self.0.lock().unwrap().stops += 1;
    }
}

type Sink = Box<dyn FnMut(LifecycleEvent)>;

struct Harness {
    engine: VoipEngine<MockSocket, MockAudio, Sink>,
    sip: MockSocket,
    media: MockSocket,
    audio: MockAudio,
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
    base: Instant,
}

impl Harness {
    fn new(start_on_boot: bool) -> Self {
        let config = RegistrationConfig::builder()
            .sip_server("192.0.2.1".parse().unwrap(), 5060)
            .local("192.0.2.50".parse().unwrap(), 5060)
            .credentials("100", "secret")
            .codec(0)
            .start_on_boot(start_on_boot)
            .build()
            .unwrap();
        let sip = MockSocket::default();
        let media = MockSocket::default();
        let audio = MockAudio::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: Sink = Box::new(move |event| sink_events.lock().unwrap().push(event));
        let engine = VoipEngine::new(config, sip.clone(), media.clone(), audio.clone(), sink);
        Self {
            engine,
            sip,
            media,
            audio,
            events,
            base: Instant::now(),
        }
    }

    fn at(&self, offset_ms: u64) -> Instant {
        self.base + ms(offset_ms)
    }

    fn registered() -> Self {
        let mut h = Harness::new(false);
        h.engine.start_at(h.base);
        let reg = h.requests().remove(0);
        h.sip.inject(&reply(&reg, 200, &[], None), server());
        h.engine.tick_at(h.base);
        assert_eq!(h.take_events(), vec![LifecycleEvent::Ready]);
        h
    }

    fn take_events(&self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    fn messages(&self) -> Vec<Message> {
        self.sip
            .take_sent()
            .into_iter()
            .map(|(bytes, dest)| {
                assert_eq!(dest, server());
                parse_message(std::str::from_utf8(&bytes).unwrap()).unwrap()
            })
            .collect()
    }

    fn requests(&self) -> Vec<Request> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn responses(&self) -> Vec<Response> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::Response(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn queue_mic(&self, value: i16) {
        let frame = AudioFrame::new(Direction::Capture, &[value; 160]);
        self.audio.0.lock().unwrap().mic.push_back(frame);
    }

    /// Ring, answer and ACK an incoming PCMU call.
    fn establish_incoming(&mut self, at: Instant) {
        self.sip.inject(&render(&incoming_invite("in-1", "0")), server());
        self.engine.tick_at(at);
        assert_eq!(self.take_events(), vec![LifecycleEvent::Ringing]);
        assert_eq!(self.responses()[0].status_code, 180);

        self.engine.answer_at(at).unwrap();
        let ok = self.responses().remove(0);
        assert_eq!(ok.status_code, 200);

        let mut ack = base_request(
            Method::Ack,
            "sip:100@192.0.2.50:5060",
            "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKack",
            "<sip:200@192.0.2.1>;tag=caller",
            ok.header("To").unwrap(),
            "in-1",
            1,
        )
        .unwrap();
        attach_body(&mut ack.headers, &mut ack.body, None).unwrap();
        self.sip.inject(&render(&ack), server());
        self.engine.tick_at(at);
        assert_eq!(self.take_events(), vec![LifecycleEvent::CallEstablished]);
        assert_eq!(self.engine.state(), CallState::Established);
    }
}

fn render(req: &Request) -> Vec<u8> {
    req.render::<MAX_MESSAGE_LEN>().unwrap().as_bytes().to_vec()
}

fn reply(req: &Request, status: u16, extra: &[(&str, &str)], body: Option<&str>) -> Vec<u8> {
    let mut resp = build_response(req, status, "X", Some("remote-tag")).unwrap();
    for (name, value) in extra {
        resp.push_header(name, value).unwrap();
    }
    attach_body(&mut resp.headers, &mut resp.body, body).unwrap();
    resp.render::<MAX_MESSAGE_LEN>().unwrap().as_bytes().to_vec()
}

fn peer_sdp(pts: &str) -> String {
    format!(
        "v=0\r\no=peer 1 1 IN IP4 192.0.2.9\r\ns=-\r\nc=IN IP4 192.0.2.9\r\nt=0 0\r\nm=audio 7078 RTP/AVP {}\r\n",
        pts
    )
}

fn incoming_invite(call_id: &str, pts: &str) -> Request {
    let mut req = base_request(
        Method::Invite,
        "sip:100@192.0.2.50:5060",
        "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKinv",
        "<sip:200@192.0.2.1>;tag=caller",
        "<sip:100@192.0.2.1>",
        call_id,
        1,
    )
    .unwrap();
    req.push_header("Contact", "<sip:200@192.0.2.9:5060>").unwrap();
    attach_body(&mut req.headers, &mut req.body, Some(&peer_sdp(pts))).unwrap();
    req
}

fn bye(call_id: &str, cseq: u32) -> Vec<u8> {
    let mut req = base_request(
        Method::Bye,
        "sip:100@192.0.2.50:5060",
        "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKbye",
        "<sip:200@192.0.2.1>;tag=caller",
        "<sip:100@192.0.2.1>;tag=ours",
        call_id,
        cseq,
    )
    .unwrap();
    attach_body(&mut req.headers, &mut req.body, None).unwrap();
    render(&req)
}

fn decode_media(bytes: &[u8]) -> (RtpPacket<MAX_PAYLOAD>, Vec<i16>) {
    let packet = RtpPacket::<MAX_PAYLOAD>::unpack(bytes).unwrap();
    let codec = Codec::from_payload_type(packet.header.payload_type).unwrap();
    let pcm = codec.decode(&packet.payload).unwrap().to_vec();
    (packet, pcm)
}

#[test]
fn start_on_boot_registers_on_first_tick() {
    let mut h = Harness::new(true);
    assert_eq!(h.engine.state(), CallState::Idle);

    h.engine.tick_at(h.base);
    let reg = h.requests().remove(0);
    assert_eq!(reg.method, Method::Register);
    assert_eq!(h.engine.state(), CallState::Registering);

    h.sip.inject(&reply(&reg, 200, &[], None), server());
    h.engine.tick_at(h.at(20));
    assert_eq!(h.take_events(), vec![LifecycleEvent::Ready]);
    assert_eq!(h.engine.registration_state(), RegistrationState::Registered);
    assert_eq!(h.engine.state(), CallState::Registered);
}

#[test]
fn without_start_on_boot_nothing_is_sent() {
    let mut h = Harness::new(false);
    for t in 0..10 {
        h.engine.tick_at(h.at(t * 20));
    }
    assert!(h.sip.take_sent().is_empty());
    assert_eq!(h.engine.state(), CallState::Idle);
}

#[test]
fn silent_server_reports_not_ready_once() {
    let mut h = Harness::new(true);
    let mut t = 0;
    while t <= 30_000 {
        h.engine.tick_at(h.at(t));
        t += 100;
    }
    assert_eq!(h.take_events(), vec![LifecycleEvent::NotReady]);
    assert_eq!(h.engine.state(), CallState::Registering);
    assert!(h.engine.sip_stats().retransmissions > 0);
}

#[test]
fn incoming_call_carries_audio_both_ways_until_bye() {
    let mut h = Harness::registered();
    h.queue_mic(1000);
    h.establish_incoming(h.at(0));
    assert_eq!(h.audio.0.lock().unwrap().starts, 1);

    // First frame goes out on the tick that established the call, mic gain x2.
    let sent = h.media.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, peer_media());
    let (packet, pcm) = decode_media(&sent[0].0);
    assert_eq!(packet.header.payload_type, 0);
    assert_eq!(pcm.len(), 160);
    assert!(pcm.iter().all(|s| (s - 2000).abs() < 100), "{:?}", &pcm[..4]);

    // Peer audio is played with amp gain x6.
    let mut peer = RtpStream::with_session(
        Codec::Pcmu,
        h.engine.config().rtp_local(),
        RtpSession::with_initial(0x1234, 0, 500, 0),
        160,
    );
    h.media.inject(&peer.packetize(&[1000; 160]).unwrap(), peer_media());
    h.engine.tick_at(h.at(20));
    let played = h.audio.0.lock().unwrap().speaker.last().cloned().unwrap();
    assert_eq!(played.direction, Direction::Playback);
    assert!((played.samples[0] - 6000).abs() < 300, "{}", played.samples[0]);

    // Only one frame per 20 ms.
    h.engine.tick_at(h.at(25));
    assert_eq!(h.media.take_sent().len(), 1);

    h.sip.inject(&bye("in-1", 2), server());
    h.engine.tick_at(h.at(40));
    assert_eq!(h.responses()[0].status_code, 200);
    assert_eq!(h.take_events(), vec![LifecycleEvent::CallEnded]);
    assert_eq!(h.engine.state(), CallState::Ended);
    assert_eq!(h.audio.0.lock().unwrap().stops, 1);
    let rtp = h.engine.rtp_stats().unwrap();
    assert_eq!(rtp.packets_received, 1);
    assert_eq!(rtp.packets_sent, 2);

    h.media.take_sent();
    h.engine.tick_at(h.at(40) + sip_core::call::ENDED_GRACE);
    assert_eq!(h.engine.state(), CallState::Registered);
    assert!(h.media.take_sent().is_empty());
}

#[test]
fn outgoing_call_uses_negotiated_codec() {
    let mut h = Harness::new(false);
    assert!(matches!(
        h.engine.dial_at("200", None, h.base),
        Err(VoipError::Sip(SipError::NotRegistered))
    ));

    let mut h = Harness::registered();
    h.engine.dial_at("200", Some("Front Door"), h.at(0)).unwrap();
    let invite = h.requests().remove(0);
    assert_eq!(invite.method, Method::Invite);
    assert!(invite.header("From").unwrap().starts_with("\"Front Door\""));
    assert_eq!(h.engine.state(), CallState::Inviting);

    let ok = reply(
        &invite,
        200,
        &[("Contact", "<sip:200@192.0.2.9:5060>")],
        Some(&peer_sdp("8")),
    );
    h.sip.inject(&ok, server());
    h.engine.tick_at(h.at(20));
    assert_eq!(h.requests()[0].method, Method::Ack);
    assert_eq!(h.take_events(), vec![LifecycleEvent::CallEstablished]);

    let sent = h.media.take_sent();
    let (packet, _) = decode_media(&sent[0].0);
    assert_eq!(packet.header.payload_type, 8);

    h.engine.hangup_at(h.at(30));
    let bye = h.requests().remove(0);
    assert_eq!(bye.method, Method::Bye);
    assert_eq!(h.engine.state(), CallState::Ending);

    h.sip.inject(&reply(&bye, 200, &[], None), server());
    h.engine.tick_at(h.at(40));
    assert_eq!(h.take_events(), vec![LifecycleEvent::CallEnded]);
    assert_eq!(h.audio.0.lock().unwrap().stops, 1);
}

#[test]
fn underruns_and_overruns_are_counted() {
    let mut h = Harness::registered();
    h.audio.0.lock().unwrap().speaker_full = true;
    h.establish_incoming(h.at(0));
    h.engine.tick_at(h.at(20));

    let stats = h.engine.stats();
    assert_eq!(stats.mic_underruns, 2);
    assert_eq!(stats.speaker_overruns, 2);
    assert_eq!(stats.frames_sent, 2);

    // Silence is still sent so the peer keeps its NAT binding.
    let sent = h.media.take_sent();
    assert_eq!(sent.len(), 2);
    let (_, pcm) = decode_media(&sent[1].0);
    assert!(pcm.iter().all(|s| s.abs() < 10));
}

#[test]
fn stray_media_is_dropped() {
    let mut h = Harness::registered();
    h.media.inject(&[0x80, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1], peer_media());
    h.engine.tick_at(h.at(20));
    assert_eq!(h.engine.stats().media_without_call, 1);

    h.establish_incoming(h.at(40));
    let mut stranger = RtpStream::with_session(
        Codec::Pcmu,
        h.engine.config().rtp_local(),
        RtpSession::with_initial(0x99, 0, 0, 0),
        160,
    );
    h.media
        .inject(&stranger.packetize(&[500; 160]).unwrap(), "198.51.100.7:7078".parse().unwrap());
    h.engine.tick_at(h.at(60));
    let rtp = h.engine.rtp_stats().unwrap();
    assert_eq!(rtp.foreign_source, 1);
    assert_eq!(rtp.packets_received, 0);
}

#[test]
fn unsupported_codec_never_starts_media() {
    let mut h = Harness::registered();
    h.sip.inject(&render(&incoming_invite("in-9", "9")), server());
    h.engine.tick_at(h.at(20));
    assert_eq!(
        h.take_events(),
        vec![LifecycleEvent::Failed(Failure::Negotiation)]
    );
    assert_eq!(h.responses()[0].status_code, 488);
    assert_eq!(h.engine.state(), CallState::Registered);
    assert_eq!(h.audio.0.lock().unwrap().starts, 0);
    assert!(h.engine.rtp_stats().is_none());
}

#[test]
fn send_failures_do_not_stop_the_loop() {
    let mut h = Harness::new(false);
    h.sip.fail_sends(true);
    h.engine.start_at(h.base);
    assert_eq!(h.engine.stats().send_errors, 1);

    h.sip.fail_sends(false);
    h.engine.tick_at(h.at(500));
    let retransmit = h.requests();
    assert_eq!(retransmit.len(), 1);
    assert_eq!(retransmit[0].method, Method::Register);
}

#[test]
fn stop_withdraws_registration() {
    let mut h = Harness::registered();
    h.engine.stop_at(h.at(20));
    let unregister = h.requests().remove(0);
    assert_eq!(unregister.method, Method::Register);
    assert_eq!(unregister.header("Expires"), Some("0"));
    assert_eq!(h.take_events(), vec![LifecycleEvent::NotReady]);
    assert_eq!(h.engine.state(), CallState::Idle);

    h.engine.hangup_at(h.at(40));
    assert!(h.sip.take_sent().is_empty());
}
