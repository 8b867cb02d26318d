use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LINE_LENGTH: usize = 1024 * 1024;
const EVENT_CAPACITY: usize = 100;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Settings for a [`Session`](crate::Session)
///
/// Durations are (de)serialized as milliseconds so the struct can be
/// embedded in an application's own config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a call waits for its response; `None` waits until the
    /// connection is lost
    #[serde(rename = "request_timeout_ms", with = "option_duration_ms")]
    pub request_timeout: Option<Duration>,

    /// Limit for establishing the TCP connection
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Longest accepted inbound line in bytes
    pub max_line_length: usize,

    /// Events buffered per subscriber before it starts lagging
    pub event_capacity: usize,

    /// Send `Server.GetStatus` as soon as a connection is up
    pub refresh_on_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(REQUEST_TIMEOUT),
            connect_timeout: CONNECT_TIMEOUT,
            max_line_length: MAX_LINE_LENGTH,
            event_capacity: EVENT_CAPACITY,
            refresh_on_connect: false,
        }
    }
}

impl SessionConfig {
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_refresh_on_connect(mut self, refresh: bool) -> Self {
        self.refresh_on_connect = refresh;
        self
    }
}

/// Backoff policy for [`Reconnector`](crate::Reconnector)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,

    /// Upper bound for the doubling delay
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,

    /// Request a full status after every successful (re)connect
    pub refresh_status: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            refresh_status: true,
        }
    }
}

impl ReconnectConfig {
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn with_refresh_status(mut self, refresh: bool) -> Self {
        self.refresh_status = refresh;
        self
    }

    /// Delay to use after `current` failed: initial, then doubling up to the max
    pub fn next_backoff(&self, current: Duration) -> Duration {
        if current.is_zero() {
            self.initial_backoff
        } else {
            (current * 2).min(self.max_backoff)
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
