use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Call once at startup.
///
/// Info and errors are always logged; `debug` turns on per-message tracing for
/// this crate. `RUST_LOG` wins over both when set.
pub fn init(debug: bool, json: bool) {
    let default = if debug { "info,relay=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("relay: logging already initialised: {e}");
    }
}
