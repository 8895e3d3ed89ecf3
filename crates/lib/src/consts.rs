/// Application name used for config, data and cache directories.
pub const APP_NAME: &str = "realize";

/// Length of the truncated hash used in store path base names.
pub const OBJ_HASH_PREFIX_LEN: usize = 32;

/// Maximum length of the name part of a store path.
pub const STORE_PATH_NAME_MAX_LEN: usize = 211;

/// Name of the flake entry file inside a flake source tree.
pub const FLAKE_FILE: &str = "flake.lua";

/// Name of the lock file written next to `flake.lua`.
pub const LOCK_FILE: &str = "flake.lock";

/// Directory inside the store root holding store metadata.
pub const STORE_META_DIR: &str = ".realize";

/// Environment variable overriding the store location.
pub const STORE_DIR_ENV: &str = "REALIZE_STORE_DIR";

/// Environment variable that disables live evaluation when set to `0`.
pub const ALLOW_EVAL_ENV: &str = "REALIZE_ALLOW_EVAL";

/// Eval cache schema directory name.
pub const EVAL_CACHE_DIR: &str = "eval-cache-v1";

/// Key used to mark lazily forced attribute values in Lua tables.
pub const LAZY_KEY: &str = "__realize_lazy";

/// `SOURCE_DATE_EPOCH` given to every builder.
pub const SOURCE_DATE_EPOCH: &str = "315532800";
