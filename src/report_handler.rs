//! Observation reporting policy
//!
//! Tracks the LWM2M notification attributes of an observed node and decides,
//! on every value change or timer tick, whether a notification goes out now,
//! waits for `pmin`, or is dropped.

use std::time::{Duration, Instant};

use crate::coap_types::QueryParams;
use crate::error::{Lwm2mError, Result};

/// Notification attributes set through Write-Attributes or an Observe query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationAttributes {
    /// Minimum period between notifications, seconds
    pub pmin: Option<u32>,
    /// Maximum period between notifications, seconds
    pub pmax: Option<u32>,
    /// Greater-than threshold
    pub gt: Option<f64>,
    /// Less-than threshold
    pub lt: Option<f64>,
    /// Step
    pub st: Option<f64>,
}

impl NotificationAttributes {
    /// Parse `pmin`, `pmax`, `gt`, `lt` and `st` from a URI query
    ///
    /// Unknown keys are ignored.
    pub fn parse(query: &QueryParams) -> Result<Self> {
        let mut attributes = Self::default();
        for (key, value) in &query.pairs {
            match key.as_str() {
                "pmin" => attributes.pmin = Some(parse_number(key, value)?),
                "pmax" => attributes.pmax = Some(parse_number(key, value)?),
                "gt" => attributes.gt = Some(parse_threshold(key, value)?),
                "lt" => attributes.lt = Some(parse_threshold(key, value)?),
                "st" => attributes.st = Some(parse_threshold(key, value)?),
                _ => {}
            }
        }
        attributes.validate()?;
        Ok(attributes)
    }

    /// Check if no attribute is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay the attributes set in `other`
    pub fn merge(&mut self, other: &NotificationAttributes) {
        self.pmin = other.pmin.or(self.pmin);
        self.pmax = other.pmax.or(self.pmax);
        self.gt = other.gt.or(self.gt);
        self.lt = other.lt.or(self.lt);
        self.st = other.st.or(self.st);
    }

    /// Check attribute consistency
    pub fn validate(&self) -> Result<()> {
        if let (Some(pmin), Some(pmax)) = (self.pmin, self.pmax)
            && pmax > 0
            && pmin > pmax
        {
            return Err(Lwm2mError::InvalidAttribute(format!(
                "pmin {} greater than pmax {}",
                pmin, pmax
            )));
        }
        if [self.gt, self.lt, self.st]
            .into_iter()
            .flatten()
            .any(|t| !t.is_finite())
        {
            return Err(Lwm2mError::InvalidAttribute("non-finite threshold".into()));
        }
        if let Some(st) = self.st
            && st < 0.0
        {
            return Err(Lwm2mError::InvalidAttribute("negative st".into()));
        }
        if let (Some(gt), Some(lt)) = (self.gt, self.lt) {
            let step = self.st.unwrap_or(0.0);
            if lt + 2.0 * step >= gt {
                return Err(Lwm2mError::InvalidAttribute(format!(
                    "lt {} and gt {} overlap",
                    lt, gt
                )));
            }
        }
        Ok(())
    }

    fn has_thresholds(&self) -> bool {
        self.gt.is_some() || self.lt.is_some() || self.st.is_some()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Lwm2mError::InvalidAttribute(format!("{}={}", key, value)))
}

/// `gt`, `lt` and `st` must be finite
fn parse_threshold(key: &str, value: &str) -> Result<f64> {
    let threshold: f64 = parse_number(key, value)?;
    if !threshold.is_finite() {
        return Err(Lwm2mError::InvalidAttribute(format!("{}={}", key, value)));
    }
    Ok(threshold)
}

/// What to do with a value change or timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDecision {
    /// Send a notification now
    Send,
    /// Hold the notification until `pmin` elapses
    Defer,
    /// Nothing to report
    Suppress,
}

/// Per-node notification policy
#[derive(Debug, Clone, Default)]
pub struct ReportHandler {
    attributes: NotificationAttributes,
    last_sent: Option<Instant>,
    last_value: Option<f64>,
    pending: bool,
}

impl ReportHandler {
    /// Create a handler with the given attributes
    pub fn new(attributes: NotificationAttributes) -> Self {
        Self {
            attributes,
            ..Self::default()
        }
    }

    /// Current attributes
    pub fn attributes(&self) -> &NotificationAttributes {
        &self.attributes
    }

    /// Overlay new attributes
    pub fn set_attributes(&mut self, attributes: &NotificationAttributes) {
        self.attributes.merge(attributes);
    }

    /// Check if a change is waiting to be notified
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Decide what a value change triggers
    ///
    /// `value` is the numeric reading for threshold checks, `None` for
    /// non-numeric nodes where any change qualifies.
    pub fn value_changed(&mut self, now: Instant, value: Option<f64>) -> ReportDecision {
        if !self.threshold_crossed(value) {
            return ReportDecision::Suppress;
        }
        if self.pmin_blocks(now) {
            self.pending = true;
            return ReportDecision::Defer;
        }
        ReportDecision::Send
    }

    /// Decide what a timer tick triggers: a deferred send or a `pmax` refresh
    pub fn timer_expired(&mut self, now: Instant) -> ReportDecision {
        if self.pending && !self.pmin_blocks(now) {
            return ReportDecision::Send;
        }
        if let (Some(pmax), Some(last)) = (self.attributes.pmax, self.last_sent)
            && pmax > 0
            && now >= last + Duration::from_secs(u64::from(pmax))
        {
            return ReportDecision::Send;
        }
        ReportDecision::Suppress
    }

    /// Keep a change queued for the next timer tick
    pub(crate) fn mark_pending(&mut self) {
        self.pending = true;
    }

    /// Record that a notification carrying `value` went out
    pub fn notification_sent(&mut self, now: Instant, value: Option<f64>) {
        self.last_sent = Some(now);
        self.last_value = value;
        self.pending = false;
    }

    /// Earliest instant at which `timer_expired` may return `Send`
    pub fn next_deadline(&self) -> Option<Instant> {
        let last = self.last_sent?;
        let pmin = self
            .pending
            .then(|| last + Duration::from_secs(u64::from(self.attributes.pmin.unwrap_or(0))));
        let pmax = self
            .attributes
            .pmax
            .filter(|p| *p > 0)
            .map(|p| last + Duration::from_secs(u64::from(p)));
        match (pmin, pmax) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn pmin_blocks(&self, now: Instant) -> bool {
        match (self.attributes.pmin, self.last_sent) {
            (Some(pmin), Some(last)) => now < last + Duration::from_secs(u64::from(pmin)),
            _ => false,
        }
    }

    fn threshold_crossed(&self, value: Option<f64>) -> bool {
        let (Some(value), Some(last)) = (value, self.last_value) else {
            return true;
        };
        if !self.attributes.has_thresholds() {
            return true;
        }
        if let Some(gt) = self.attributes.gt
            && (last > gt) != (value > gt)
        {
            return true;
        }
        if let Some(lt) = self.attributes.lt
            && (last < lt) != (value < lt)
        {
            return true;
        }
        if let Some(st) = self.attributes.st
            && (value - last).abs() >= st
        {
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes(query: &str) -> NotificationAttributes {
        NotificationAttributes::parse(&QueryParams::parse(query)).unwrap()
    }

    #[test]
    fn test_parse_attributes() {
        let attrs = attributes("pmax=200&pmin=120");
        assert_eq!(attrs.pmin, Some(120));
        assert_eq!(attrs.pmax, Some(200));
        assert_eq!(attrs.gt, None);

        let attrs = attributes("gt=50.5&lt=10&st=2");
        assert_eq!(attrs.gt, Some(50.5));
        assert_eq!(attrs.lt, Some(10.0));
        assert_eq!(attrs.st, Some(2.0));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        let parse = |q| NotificationAttributes::parse(&QueryParams::parse(q));
        assert!(parse("pmin=abc").is_err());
        assert!(parse("pmin=300&pmax=200").is_err());
        assert!(parse("gt=10&lt=20").is_err());
        assert!(parse("gt=10&lt=5&st=3").is_err());
        assert!(parse("st=-1").is_err());
        assert!(parse("gt=NaN").is_err());
        assert!(parse("st=inf").is_err());
        assert!(parse("lt=-infinity").is_err());
    }

    #[test]
    fn test_merge_keeps_unset() {
        let mut attrs = attributes("pmin=10&pmax=60");
        attrs.merge(&attributes("pmax=120"));
        assert_eq!(attrs.pmin, Some(10));
        assert_eq!(attrs.pmax, Some(120));
    }

    #[test]
    fn test_pmin_defers_then_sends() {
        let t0 = Instant::now();
        let mut handler = ReportHandler::new(attributes("pmin=10"));
        handler.notification_sent(t0, None);

        let t1 = t0 + Duration::from_secs(3);
        assert_eq!(handler.value_changed(t1, None), ReportDecision::Defer);
        assert!(handler.is_pending());
        assert_eq!(handler.next_deadline(), Some(t0 + Duration::from_secs(10)));
        assert_eq!(handler.timer_expired(t1), ReportDecision::Suppress);

        let t2 = t0 + Duration::from_secs(10);
        assert_eq!(handler.timer_expired(t2), ReportDecision::Send);
        handler.notification_sent(t2, None);
        assert!(!handler.is_pending());
    }

    #[test]
    fn test_change_after_pmin_sends() {
        let t0 = Instant::now();
        let mut handler = ReportHandler::new(attributes("pmin=5"));
        handler.notification_sent(t0, None);
        assert_eq!(
            handler.value_changed(t0 + Duration::from_secs(6), None),
            ReportDecision::Send
        );
    }

    #[test]
    fn test_pmax_forces_send() {
        let t0 = Instant::now();
        let mut handler = ReportHandler::new(attributes("pmax=30"));
        handler.notification_sent(t0, Some(1.0));
        assert_eq!(
            handler.timer_expired(t0 + Duration::from_secs(29)),
            ReportDecision::Suppress
        );
        assert_eq!(
            handler.timer_expired(t0 + Duration::from_secs(30)),
            ReportDecision::Send
        );
    }

    #[test]
    fn test_thresholds() {
        let t0 = Instant::now();
        let mut handler = ReportHandler::new(attributes("gt=50&st=5"));
        handler.notification_sent(t0, Some(40.0));

        assert_eq!(handler.value_changed(t0, Some(42.0)), ReportDecision::Suppress);
        assert_eq!(handler.value_changed(t0, Some(45.0)), ReportDecision::Send);
        assert_eq!(handler.value_changed(t0, Some(51.0)), ReportDecision::Send);
    }

    #[test]
    fn test_non_numeric_always_qualifies() {
        let t0 = Instant::now();
        let mut handler = ReportHandler::new(attributes("st=5"));
        handler.notification_sent(t0, None);
        assert_eq!(handler.value_changed(t0, None), ReportDecision::Send);
    }
}
