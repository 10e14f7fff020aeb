use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the global tracing subscriber. Plain formatter by default, json
/// when `json` is set (what the hosted service ships with).
pub fn init_logger(json: bool) {
    INIT.call_once(|| {
        if json {
            tracing_subscriber::fmt().json().init();
        } else {
            tracing_subscriber::fmt().init();
        }
    });
}
