fn main() {
    let env = env_logger::Env::default()
        .filter_or("VOIP_LOG_LEVEL", "debug")
        .write_style_or("VOIP_LOG_STYLE", "always");

    env_logger::init_from_env(env);

    if let Err(err) = app::run() {
        log::error!("app error: {err}");
        std::process::exit(1);
    }
}
