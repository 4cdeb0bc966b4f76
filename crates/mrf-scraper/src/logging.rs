//! Structured logging setup (spec §10): `tracing` + `tracing-subscriber`, human-readable by
//! default, newline-delimited JSON under `--json-logs`.

use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `verbose` raises the default filter from `info` to `debug` for
/// this crate graph; `RUST_LOG` always wins when set.
pub fn init(json: bool, verbose: bool) {
    let default_directive = if verbose {
        "mrf_scraper=debug,mrf_fetch=debug,mrf_core=debug,info"
    } else {
        "mrf_scraper=info,mrf_fetch=info,mrf_core=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // stderr only: the worker subcommand's stdout is a single-line JSON result protocol, and
    // log output must never land on that channel.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
