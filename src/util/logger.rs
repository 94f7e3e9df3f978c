//! This module is for interacting with the `log` crate. If the
//! `builtin_env_logger` feature is enabled (it is part of the default
//! features), tephra will attempt to initialize a built-in `env_logger` when a
//! runtime is created, so that a host embedding tephra can see the collector's
//! log output without any set-up of its own. If the host has already
//! initialized a logger, the attempt fails silently and the host's logger
//! wins.

/// Attempt to initialize the built-in logger, unless the
/// `builtin_env_logger` feature is disabled.
pub(crate) fn try_init() {
    #[cfg(feature = "builtin_env_logger")]
    {
        let result = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .try_init();
        match result {
            Ok(()) => debug!("Tephra initialized the built-in env_logger."),
            Err(_) => debug!(
                "Tephra failed to initialize the built-in env_logger. \
                 Possibly the host has already initialized a logger."
            ),
        }
    }
    #[cfg(not(feature = "builtin_env_logger"))]
    debug!("Tephra didn't initialize the built-in env_logger. The builtin_env_logger feature is disabled.");
}
