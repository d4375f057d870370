use serde::{Deserialize, Serialize};

/// A value that was either computed from market data or substituted by a
/// documented fallback because the data could not be used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Estimate<T> {
    Computed { value: T },
    Fallback { value: T, reason: String },
}

impl<T> Estimate<T> {
    pub fn computed(value: T) -> Self {
        Estimate::Computed { value }
    }

    pub fn fallback(value: T, reason: impl Into<String>) -> Self {
        Estimate::Fallback {
            value,
            reason: reason.into(),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Estimate::Computed { value } | Estimate::Fallback { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Estimate::Computed { value } | Estimate::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Estimate::Fallback { .. })
    }

    /// Why the fallback was used, if it was.
    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Estimate::Fallback { reason, .. } => Some(reason),
            Estimate::Computed { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Estimate<U> {
        match self {
            Estimate::Computed { value } => Estimate::Computed { value: f(value) },
            Estimate::Fallback { value, reason } => Estimate::Fallback {
                value: f(value),
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_keeps_reason_through_map() {
        let est = Estimate::fallback(15.0, "no bars").map(|v: f64| v * 2.0);
        assert!(est.is_fallback());
        assert_eq!(est.fallback_reason(), Some("no bars"));
        assert_eq!(*est.value(), 30.0);
    }

    #[test]
    fn computed_has_no_reason() {
        let est = Estimate::computed(3);
        assert!(!est.is_fallback());
        assert_eq!(est.fallback_reason(), None);
        assert_eq!(est.into_value(), 3);
    }
}
