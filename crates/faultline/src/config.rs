use faultline_types::Cell;
use std::num::NonZeroUsize;
use tracing::warn;

pub const DEFAULT_LINE_PREFIX: &str = "[debug]";
pub const DEFAULT_ERROR_CALLBACK: &str = "OnRuntimeError";
pub const DEFAULT_MAX_FRAMES: usize = 256;
/// Entry index some host libraries pass to exec for their own bookkeeping;
/// an invalid-index error for it is expected.
pub const COMPAT_EXEC_INDEX: Cell = -10;

const PREFIX_ENV: &str = "FAULTLINE_PREFIX";
const MAX_FRAMES_ENV: &str = "FAULTLINE_MAX_FRAMES";
const ERROR_CALLBACK_ENV: &str = "FAULTLINE_ERROR_CALLBACK";
const NATIVE_SYMBOLS_ENV: &str = "FAULTLINE_NATIVE_SYMBOLS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Put in front of every report line, separated by a space.
    pub line_prefix: String,
    pub max_guest_frames: usize,
    pub max_native_frames: NonZeroUsize,
    /// Public invoked as `callback(code, &suppress)` before a runtime error is printed.
    pub error_callback: String,
    pub compat_exec_index: Cell,
    /// Name native frames with `dladdr`. Off avoids the loader lock when a
    /// crash inside `dlopen` would otherwise hang the report.
    pub resolve_native_modules: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            line_prefix: DEFAULT_LINE_PREFIX.to_owned(),
            max_guest_frames: DEFAULT_MAX_FRAMES,
            max_native_frames: NonZeroUsize::new(DEFAULT_MAX_FRAMES)
                .expect("invariant violated: default frame bound must be non-zero"),
            error_callback: DEFAULT_ERROR_CALLBACK.to_owned(),
            compat_exec_index: COMPAT_EXEC_INDEX,
            resolve_native_modules: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `FAULTLINE_PREFIX`, `FAULTLINE_MAX_FRAMES`,
    /// `FAULTLINE_ERROR_CALLBACK` and `FAULTLINE_NATIVE_SYMBOLS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(prefix) = lookup(PREFIX_ENV) {
            config.line_prefix = prefix;
        }
        if let Some(raw) = lookup(MAX_FRAMES_ENV) {
            match raw.trim().parse::<NonZeroUsize>() {
                Ok(max) => {
                    config.max_guest_frames = max.get();
                    config.max_native_frames = max;
                }
                Err(error) => warn!(value = %raw, %error, "ignoring {MAX_FRAMES_ENV}"),
            }
        }
        if let Some(callback) = lookup(ERROR_CALLBACK_ENV).filter(|name| !name.is_empty()) {
            config.error_callback = callback;
        }
        if let Some(raw) = lookup(NATIVE_SYMBOLS_ENV) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => config.resolve_native_modules = true,
                "0" | "false" | "off" | "no" => config.resolve_native_modules = false,
                _ => warn!(value = %raw, "ignoring {NATIVE_SYMBOLS_ENV}"),
            }
        }
        config
    }
}
