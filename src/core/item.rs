use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest relative expiration memcached accepts; anything longer must be sent
/// as an absolute unix timestamp.
pub const MAX_RELATIVE_EXPTIME: u64 = 60 * 60 * 24 * 30;

/// A value as stored on (or fetched from) a memcached server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub key: String,
    pub value: Bytes,
    pub flags: u32,
    /// Present when the item was fetched with `gets`
    pub cas: Option<u64>,
}

impl CacheItem {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, flags: u32) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flags,
            cas: None,
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = Some(cas);
        self
    }
}

/// Item lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    #[default]
    Never,
    After(Duration),
    At(SystemTime),
}

impl Expiration {
    /// Encode as the `exptime` field of a storage command.
    pub fn to_exptime(&self) -> u32 {
        self.to_exptime_at(SystemTime::now())
    }

    pub(crate) fn to_exptime_at(&self, now: SystemTime) -> u32 {
        match self {
            Expiration::Never => 0,
            Expiration::After(ttl) => {
                let mut secs = ttl.as_secs();
                // memcached treats 0 as "never"; round sub-second ttls up
                if secs == 0 && !ttl.is_zero() {
                    secs = 1;
                }
                if secs <= MAX_RELATIVE_EXPTIME {
                    secs as u32
                } else {
                    let base = now
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    clamp_u32(base.saturating_add(secs))
                }
            }
            Expiration::At(when) => {
                let ts = when
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                // A timestamp in the past must still expire the item; -1 is not
                // representable here so use the smallest absolute timestamp.
                if ts <= MAX_RELATIVE_EXPTIME {
                    (MAX_RELATIVE_EXPTIME + 1) as u32
                } else {
                    clamp_u32(ts)
                }
            }
        }
    }
}

impl From<Duration> for Expiration {
    fn from(ttl: Duration) -> Self {
        if ttl.is_zero() {
            Expiration::Never
        } else {
            Expiration::After(ttl)
        }
    }
}

fn clamp_u32(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

/// Outcome of a check-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    Stored,
    /// The item was modified since the token was read
    Conflict,
    NotFound,
}
