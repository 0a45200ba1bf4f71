use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static ACCESS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Target used by the HTTP access log layer.
pub const ACCESS_TARGET: &str = "http.access";

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` drives the console filter (default `info`). With
/// `DEVPROXY_ACCESS_LOG_ROLL=1` access-log events are additionally written to a
/// rolling file without ANSI colors.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer();
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));

    match access_log_settings() {
        Some(settings) => {
            if std::fs::create_dir_all(&settings.dir).is_err() {
                tracing::warn!(directory = %settings.dir, "failed to create access log directory");
            }
            let writer = match settings.rotation.as_str() {
                "hourly" => tracing_appender::rolling::hourly(&settings.dir, &settings.prefix),
                "minutely" => tracing_appender::rolling::minutely(&settings.dir, &settings.prefix),
                _ => tracing_appender::rolling::daily(&settings.dir, &settings.prefix),
            };
            let (nb, guard) = tracing_appender::non_blocking(writer);
            let _ = ACCESS_GUARD.set(guard);
            let targets = Targets::new().with_target(ACCESS_TARGET, tracing::Level::INFO);
            let access_layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(nb)
                .with_filter(targets);
            let _ = registry.with(access_layer).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct AccessLogSettings {
    dir: String,
    prefix: String,
    rotation: String,
}

fn access_log_settings() -> Option<AccessLogSettings> {
    if std::env::var("DEVPROXY_ACCESS_LOG_ROLL").ok().as_deref() != Some("1") {
        return None;
    }
    let dir = std::env::var("DEVPROXY_ACCESS_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "logs".to_string());
    let prefix =
        std::env::var("DEVPROXY_ACCESS_LOG_PREFIX").unwrap_or_else(|_| "http-access".into());
    let rotation = std::env::var("DEVPROXY_ACCESS_LOG_ROTATION")
        .unwrap_or_else(|_| "daily".into())
        .to_ascii_lowercase();
    Some(AccessLogSettings {
        dir,
        prefix,
        rotation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_log_disabled_unless_flag_set() {
        std::env::remove_var("DEVPROXY_ACCESS_LOG_ROLL");
        assert_eq!(access_log_settings(), None);
    }
}
