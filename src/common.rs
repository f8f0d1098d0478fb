//! Read preferences.
use error::Error::ArgumentError;
use error::Result;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// The default width of the latency window.
pub const DEFAULT_LOCAL_THRESHOLD_MS: u64 = 15;

/// Indicates how a server should be selected for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// A set of key/value labels. A server matches a tag set only when it
/// carries every pair in the set.
pub type TagSet = BTreeMap<String, String>;

/// Describes how to pick a server. Read preferences are immutable values;
/// the `with_*` methods return modified copies.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPreference {
    pub mode: ReadMode,
    #[serde(default)]
    pub tag_sets: Vec<TagSet>,
    #[serde(default, with = "::options::duration_ms_opt")]
    pub max_staleness: Option<Duration>,
    #[serde(default = "default_local_threshold", with = "::options::duration_ms")]
    pub local_threshold: Duration,
}

fn default_local_threshold() -> Duration {
    Duration::from_millis(DEFAULT_LOCAL_THRESHOLD_MS)
}

impl Default for ReadPreference {
    fn default() -> ReadPreference {
        ReadPreference::primary()
    }
}

impl ReadPreference {
    /// Creates a read preference, validating the mode/tag-set combination.
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<TagSet>>) -> Result<ReadPreference> {
        let pref = ReadPreference {
            mode: mode,
            tag_sets: tag_sets.unwrap_or_default(),
            max_staleness: None,
            local_threshold: default_local_threshold(),
        };
        pref.validate()?;
        Ok(pref)
    }

    fn with_mode(mode: ReadMode) -> ReadPreference {
        ReadPreference {
            mode: mode,
            tag_sets: Vec::new(),
            max_staleness: None,
            local_threshold: default_local_threshold(),
        }
    }

    pub fn primary() -> ReadPreference {
        ReadPreference::with_mode(ReadMode::Primary)
    }

    pub fn primary_preferred() -> ReadPreference {
        ReadPreference::with_mode(ReadMode::PrimaryPreferred)
    }

    pub fn secondary() -> ReadPreference {
        ReadPreference::with_mode(ReadMode::Secondary)
    }

    pub fn secondary_preferred() -> ReadPreference {
        ReadPreference::with_mode(ReadMode::SecondaryPreferred)
    }

    pub fn nearest() -> ReadPreference {
        ReadPreference::with_mode(ReadMode::Nearest)
    }

    /// Returns a copy with the given tag sets.
    pub fn with_tag_sets(&self, tag_sets: Vec<TagSet>) -> Result<ReadPreference> {
        let mut pref = self.clone();
        pref.tag_sets = tag_sets;
        pref.validate()?;
        Ok(pref)
    }

    /// Returns a copy with the given maximum staleness.
    pub fn with_max_staleness(&self, max_staleness: Duration) -> Result<ReadPreference> {
        let mut pref = self.clone();
        pref.max_staleness = Some(max_staleness);
        pref.validate()?;
        Ok(pref)
    }

    /// Returns a copy with the given latency window.
    pub fn with_local_threshold(&self, local_threshold: Duration) -> ReadPreference {
        let mut pref = self.clone();
        pref.local_threshold = local_threshold;
        pref
    }

    /// Checks the invariants that cannot be expressed in the type.
    pub fn validate(&self) -> Result<()> {
        if self.mode == ReadMode::Primary {
            if !self.tag_sets.is_empty() {
                return Err(ArgumentError(
                    "Tag sets cannot be combined with the Primary read mode.".to_owned()));
            }
            if self.max_staleness.is_some() {
                return Err(ArgumentError(
                    "Max staleness cannot be combined with the Primary read mode.".to_owned()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{{ mode: {:?}", self.mode)?;
        if !self.tag_sets.is_empty() {
            write!(fmt, ", tagSets: {:?}", self.tag_sets)?;
        }
        if let Some(staleness) = self.max_staleness {
            write!(fmt, ", maxStaleness: {:?}", staleness)?;
        }
        write!(fmt, " }}")
    }
}

/// Builds a tag set from string pairs.
pub fn tag_set(pairs: &[(&str, &str)]) -> TagSet {
    pairs.iter().map(|&(k, v)| (k.to_owned(), v.to_owned())).collect()
}
