//! Compile-time configuration loaded via `toml-cfg` from `cfg.toml`. An empty
//! `dial_target` means the phone only takes calls. `codec` is the firmware
//! selector: 0 for PCMU, 1 for PCMA.

#[toml_cfg::toml_config]
pub struct Settings {
    #[default("127.0.0.1")]
    pub sip_ip: &'static str,
    #[default(5060)]
    pub sip_port: u16,
    #[default("127.0.0.1")]
    pub local_ip: &'static str,
    #[default(5062)]
    pub local_port: u16,
    #[default(1234)]
    pub rtp_port: u16,
    #[default("100")]
    pub user: &'static str,
    #[default("")]
    pub password: &'static str,
    #[default(0)]
    pub codec: u8,
    #[default(2)]
    pub mic_gain: u8,
    #[default(6)]
    pub amp_gain: u8,
    #[default(true)]
    pub start_on_boot: bool,
    #[default(true)]
    pub auto_answer: bool,
    #[default("")]
    pub dial_target: &'static str,
}
