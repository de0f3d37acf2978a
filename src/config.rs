//! Recognized configuration options, loadable either by direct
//! construction or, behind `figment_config`, layered from environment
//! variables with [`figment::Figment`].

use serde::{Deserialize, Serialize};

/// Throughput multiple of the original `batch_size` that must be sustained
/// before the replication coordinator restores pre-backoff settings. Kept
/// as a named constant rather than end-user configuration.
pub const BACKOFF_RESTORE_THROUGHPUT_FACTOR: u32 = 2;

/// Below this, on both `batch_size` and `batches_limit`, the adaptive
/// backoff in the replication coordinator gives up instead of halving
/// further.
pub const BACKOFF_FLOOR: u32 = 5;

/// Hard timeout for a single `waitForLeaf` call.
pub const LEAF_WAIT_TIMEOUT_MS: u64 = 60_000;

/// `customChunkSize` multiplier base for the `MAX_DOC_SIZE_BIN`/
/// `MAX_DOC_SIZE` constants.
pub const MAX_DOC_SIZE_BIN: usize = 1024 * 128;
pub const MAX_DOC_SIZE: usize = 1024 * 8;

/// Bounds for the derived minimum chunk size.
pub const MIN_CHUNK_SIZE_FLOOR: usize = 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Disables auto-compaction on the local database when `true`.
    pub use_history: bool,

    pub encrypt: bool,
    pub passphrase: Option<String>,

    /// Use `CollectChunks` instead of per-leaf gets; enables the
    /// `replicate/push` and `replicate/pull` filters.
    pub read_chunks_online: bool,

    /// Multiplier for binary chunk size. Must be positive; zero is
    /// normalized to 1 by [`Config::normalized`].
    pub custom_chunk_size: u32,

    pub delete_metadata_of_deleted_files: bool,

    pub sync_only_regex: Option<String>,
    pub sync_ignore_regex: Option<String>,

    pub batch_size: u32,
    pub batches_limit: u32,

    pub disable_request_uri: bool,

    pub couch_db_uri: String,
    pub couch_db_dbname: String,
    pub couch_db_user: String,
    pub couch_db_password: String,

    /// Bypasses the milestone compatibility check.
    pub ignore_version_check: bool,

    /// When non-empty, inhibits replication (an operator-set flag warning
    /// that a version upgrade is pending).
    pub version_up_flash: String,

    /// This node's supported chunk-format version range and the version it
    /// currently writes with; `current < 0` disables the version check
    /// regardless of `ignore_version_check`.
    pub chunk_version_min: i32,
    pub chunk_version_max: i32,
    pub chunk_version_current: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_history: false,
            encrypt: false,
            passphrase: None,
            read_chunks_online: false,
            custom_chunk_size: 1,
            delete_metadata_of_deleted_files: false,
            sync_only_regex: None,
            sync_ignore_regex: None,
            batch_size: 100,
            batches_limit: 25,
            disable_request_uri: false,
            couch_db_uri: String::new(),
            couch_db_dbname: String::new(),
            couch_db_user: String::new(),
            couch_db_password: String::new(),
            ignore_version_check: false,
            version_up_flash: String::new(),
            chunk_version_min: 0,
            chunk_version_max: 2,
            chunk_version_current: 2,
        }
    }
}

impl Config {
    /// `customChunkSize` of `0` would make the splitter's effective piece
    /// size collapse to `0`; normalize it to `1` the way a multiplier
    /// setting of "unset" should behave.
    pub fn normalized_chunk_size_multiplier(&self) -> u32 {
        self.custom_chunk_size.max(1)
    }

    #[cfg(feature = "figment_config")]
    pub fn load(figment: figment::Figment) -> Result<Self, figment::Error> {
        figment.extract()
    }
}

#[cfg(all(test, feature = "figment_config"))]
mod figment_tests {
    use super::*;
    use std::io::Write;

    use figment::providers::{Format, Json};
    use figment::Figment;

    #[test]
    fn loads_overrides_from_a_json_file_over_the_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"read_chunks_online": true, "batch_size": 40, "couch_db_dbname": "notes"}}"#
        )
        .unwrap();

        let figment = Figment::from(Json::file(file.path()));
        let config = Config::load(figment).unwrap();

        assert!(config.read_chunks_online);
        assert_eq!(config.batch_size, 40);
        assert_eq!(config.couch_db_dbname, "notes");
        // Fields absent from the file fall back to Config::default().
        assert_eq!(config.batches_limit, Config::default().batches_limit);
    }
}
