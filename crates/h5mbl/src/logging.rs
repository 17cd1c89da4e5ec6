use tracing_subscriber::EnvFilter;

fn level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "trace",
        1 => "debug",
        2 => "info",
        3 => "warn",
        4 => "error",
        _ => "off",
    }
}

/// Verbosity follows the 0 (trace) to 5 (off) convention; the container
/// layer gets its own knob. `H5MBL_LOG` overrides both.
pub fn init(verbosity: u8, store_verbosity: u8) {
    let directives = format!(
        "h5mbl={app},h5mbl_core={app},h5mbl_store={store}",
        app = level(verbosity),
        store = level(store_verbosity)
    );
    let filter = EnvFilter::try_from_env("H5MBL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
