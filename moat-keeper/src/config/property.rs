use std::str::FromStr;
use std::time::Duration;

use super::ConfigError;
use super::ExternalConfig;

type Apply = fn(&mut ExternalConfig, &str) -> Result<(), ConfigError>;

/// Property name to parse-and-apply function.
const PROPERTIES: &[(&str, Apply)] = &[
    ("maxConcurrentLimit", |c, v| {
        c.max_concurrent_limit = Some(parse("maxConcurrentLimit", v)?);
        Ok(())
    }),
    ("limitForPeriod", |c, v| {
        c.limit_for_period = Some(parse("limitForPeriod", v)?);
        Ok(())
    }),
    ("limitRefreshPeriod", |c, v| {
        c.limit_refresh_period = Some(duration("limitRefreshPeriod", v)?);
        Ok(())
    }),
    ("failureRateThreshold", |c, v| {
        c.failure_rate_threshold = Some(parse("failureRateThreshold", v)?);
        Ok(())
    }),
    ("ringBufferSizeInClosedState", |c, v| {
        c.ring_buffer_size_in_closed_state = Some(parse("ringBufferSizeInClosedState", v)?);
        Ok(())
    }),
    ("ringBufferSizeInHalfOpenState", |c, v| {
        c.ring_buffer_size_in_half_open_state = Some(parse("ringBufferSizeInHalfOpenState", v)?);
        Ok(())
    }),
    ("waitDurationInOpenState", |c, v| {
        c.wait_duration_in_open_state = Some(duration("waitDurationInOpenState", v)?);
        Ok(())
    }),
    ("ignoreExceptions", |c, v| {
        c.ignore_exceptions = Some(names(v));
        Ok(())
    }),
    ("maxSpendTime", |c, v| {
        c.max_spend_time = Some(duration("maxSpendTime", v)?);
        Ok(())
    }),
    ("forcedOpen", |c, v| {
        c.forced_open = Some(parse("forcedOpen", v)?);
        Ok(())
    }),
    ("forcedDisabled", |c, v| {
        c.forced_disabled = Some(parse("forcedDisabled", v)?);
        Ok(())
    }),
    ("maxAttempts", |c, v| {
        c.max_attempts = Some(parse("maxAttempts", v)?);
        Ok(())
    }),
    ("includeExceptions", |c, v| {
        c.include_exceptions = Some(names(v));
        Ok(())
    }),
    ("excludeExceptions", |c, v| {
        c.exclude_exceptions = Some(names(v));
        Ok(())
    }),
    ("delay", |c, v| {
        c.delay = Some(duration("delay", v)?);
        Ok(())
    }),
    ("maxDelay", |c, v| {
        c.max_delay = Some(duration("maxDelay", v)?);
        Ok(())
    }),
    ("multiplier", |c, v| {
        c.multiplier = Some(parse("multiplier", v)?);
        Ok(())
    }),
    ("alsoApplyFallbackToBizException", |c, v| {
        c.also_apply_fallback_to_biz_exception =
            Some(parse("alsoApplyFallbackToBizException", v)?);
        Ok(())
    }),
];

fn parse<T>(property: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::InvalidValue {
            property,
            value: value.to_owned(),
            message: err.to_string(),
        })
}

fn duration(property: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|err| ConfigError::InvalidValue {
        property,
        value: value.to_owned(),
        message: err.to_string(),
    })
}

fn names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

impl ExternalConfig {
    /// Builds an override from `name = value` string properties.
    ///
    /// Durations use `humantime` syntax and error kind lists are comma
    /// separated.
    ///
    /// # Errors
    ///
    /// Fails on the first unknown property or malformed value.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = ExternalConfig::default();
        for (name, value) in properties {
            config.set_property(name.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    pub fn set_property(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let (_, apply) = PROPERTIES
            .iter()
            .find(|(property, _)| *property == name)
            .ok_or_else(|| ConfigError::UnknownProperty(name.to_owned()))?;
        apply(self, value)
    }
}
