use std::net::{AddrParseError, IpAddr};
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;
use voip::{Gain, LifecycleEvent, RegistrationConfig, VoipEngine, VoipError};

use crate::host_audio::HostAudio;

mod host_audio;
mod settings;

/// How long the loop sleeps between ticks. Well under one audio frame.
const TICK_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad address in settings: {0}")]
    Address(#[from] AddrParseError),
    #[error(transparent)]
    Voip(#[from] VoipError),
}

fn load_config() -> Result<RegistrationConfig, AppError> {
    let s = &settings::SETTINGS;
    let sip_ip: IpAddr = s.sip_ip.parse()?;
    let local_ip: IpAddr = s.local_ip.parse()?;

    let config = RegistrationConfig::builder()
        .sip_server(sip_ip, s.sip_port)
        .local(local_ip, s.local_port)
        .rtp_port(s.rtp_port)
        .credentials(s.user, s.password)
        .codec_index(s.codec)
        .mic_gain(Gain::Linear(s.mic_gain))
        .amp_gain(Gain::Linear(s.amp_gain))
        .start_on_boot(s.start_on_boot)
        .build()
        .map_err(VoipError::from)?;
    Ok(config)
}

pub fn run() -> Result<(), AppError> {
    info!("starting voip phone runtime");

    let config = load_config()?;
    let audio = HostAudio::new(config.audio().frame_samples);
    let dial_target = Some(settings::SETTINGS.dial_target).filter(|t| !t.is_empty());
    let auto_answer = settings::SETTINGS.auto_answer;

    let (event_tx, event_rx) = channel::<LifecycleEvent>();
    let sink = move |event: LifecycleEvent| {
        let _ = event_tx.send(event);
    };

    let mut engine = VoipEngine::bind(config, audio, sink)?;
    if !engine.config().start_on_boot() {
        engine.start();
    }

    let mut dialed = false;
    loop {
        engine.tick();

        while let Ok(event) = event_rx.try_recv() {
            match event {
                LifecycleEvent::Ready => {
                    if let Some(target) = dial_target.filter(|_| !dialed) {
                        info!("dialing {}", target);
                        match engine.dial(target, None) {
                            Ok(()) => dialed = true,
                            Err(e) => warn!("dial {} failed: {}", target, e),
                        }
                    }
                }
                LifecycleEvent::Ringing if auto_answer => {
                    if let Err(e) = engine.answer() {
                        warn!("answer failed: {}", e);
                    }
                }
                LifecycleEvent::Failed(failure) => warn!("call failed: {}", failure),
                LifecycleEvent::CallEnded if dialed => {
                    info!("outgoing call finished; {:?}", engine.rtp_stats());
                    engine.stop();
                    return Ok(());
                }
                other => info!("event: {:?}", other),
            }
        }

        thread::sleep(TICK_INTERVAL);
    }
}
