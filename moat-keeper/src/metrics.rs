use std::fmt;

use moat_limit::BreakerMetrics;
use moat_limit::ConcurrencyMetrics;
use moat_limit::RateMetrics;
use moat_limit::retry::RetryMetrics;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;

use crate::moat::MoatType;
use crate::resource::ResourceId;

/// Snapshot of every moat and the retry executor of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMetrics {
    pub resource: ResourceId,
    pub concurrent: Option<ConcurrencyMetrics>,
    pub rate: Option<RateMetrics>,
    pub breaker: Option<BreakerMetrics>,
    pub retry: Option<RetryMetrics>,
}

impl ClusterMetrics {
    pub(crate) fn empty(resource: ResourceId) -> Self {
        Self {
            resource,
            concurrent: None,
            rate: None,
            breaker: None,
            retry: None,
        }
    }
}

impl fmt::Display for ClusterMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.resource)?;
        if let Some(concurrent) = &self.concurrent {
            write!(f, " [concurrent: {concurrent}]")?;
        }
        if let Some(breaker) = &self.breaker {
            write!(f, " [breaker: {breaker}]")?;
        }
        if let Some(rate) = &self.rate {
            write!(f, " [rate: {rate}]")?;
        }
        if let Some(retry) = &self.retry {
            write!(f, " [retry: {retry}]")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Instruments {
    rejected: Counter<u64>,
    fallback: Counter<u64>,
    retry_attempts: Counter<u64>,
}

impl Default for Instruments {
    fn default() -> Self {
        let meter = global::meter("moat_keeper");
        Self {
            rejected: meter
                .u64_counter("moat.rejected")
                .with_description("Calls rejected by a moat")
                .build(),
            fallback: meter
                .u64_counter("moat.fallback")
                .with_description("Calls recovered by a fallback")
                .build(),
            retry_attempts: meter
                .u64_counter("moat.retry.attempts")
                .with_description("Attempts made under a retry policy")
                .build(),
        }
    }
}

impl Instruments {
    pub(crate) fn rejected(&self, resource: &ResourceId, moat: MoatType) {
        self.rejected.add(
            1,
            &[
                KeyValue::new("resource", resource.to_string()),
                KeyValue::new("moat", moat.as_str()),
            ],
        );
    }

    pub(crate) fn fallback(&self, resource: &ResourceId) {
        self.fallback
            .add(1, &[KeyValue::new("resource", resource.to_string())]);
    }

    pub(crate) fn retry_attempts(&self, resource: &ResourceId, attempts: u32) {
        self.retry_attempts.add(
            u64::from(attempts),
            &[KeyValue::new("resource", resource.to_string())],
        );
    }
}
