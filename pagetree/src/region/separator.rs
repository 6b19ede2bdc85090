use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// A boundary value that is either a definite key or one of the two
/// indefinite bounds.
///
/// The variant order matters: the derived ordering places `NegInfinity`
/// below and `PosInfinity` above every definite value before the keys
/// themselves are compared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Separator<K> {
    NegInfinity,
    Value(K),
    PosInfinity,
}

impl<K> Separator<K> {
    pub fn is_definite(&self) -> bool {
        matches!(self, Separator::Value(_))
    }

    pub fn value(&self) -> Option<&K> {
        match self {
            Separator::Value(k) => Some(k),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<K> {
        match self {
            Separator::Value(k) => Some(k),
            _ => None,
        }
    }
}

impl<K: Ord> Separator<K> {
    /// Compares this separator against a definite key.
    pub fn cmp_key(&self, key: &K) -> Ordering {
        match self {
            Separator::NegInfinity => Ordering::Less,
            Separator::Value(k) => k.cmp(key),
            Separator::PosInfinity => Ordering::Greater,
        }
    }
}

impl<K> From<K> for Separator<K> {
    fn from(key: K) -> Self {
        Separator::Value(key)
    }
}

impl<K: Display> Display for Separator<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Separator::NegInfinity => write!(f, "-inf"),
            Separator::Value(k) => write!(f, "{}", k),
            Separator::PosInfinity => write!(f, "+inf"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indefinite_bounds_order() {
        let low: Separator<i64> = Separator::NegInfinity;
        let high: Separator<i64> = Separator::PosInfinity;
        assert!(low < Separator::Value(i64::MIN));
        assert!(high > Separator::Value(i64::MAX));
        assert!(low < high);
        assert_eq!(Separator::Value(3).cmp(&Separator::Value(4)), Ordering::Less);
    }

    #[test]
    fn test_cmp_key() {
        assert_eq!(Separator::Value(5).cmp_key(&5), Ordering::Equal);
        assert_eq!(Separator::<i32>::NegInfinity.cmp_key(&i32::MIN), Ordering::Less);
        assert_eq!(Separator::<i32>::PosInfinity.cmp_key(&i32::MAX), Ordering::Greater);
    }

    #[test]
    fn test_clone_is_a_value_copy() {
        let original = Separator::Value(String::from("key"));
        let mut copy = original.clone();
        if let Separator::Value(ref mut s) = copy {
            s.push_str("-changed");
        }
        assert_eq!(original.value().map(String::as_str), Some("key"));
        assert_eq!(copy.into_value().as_deref(), Some("key-changed"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Separator::Value(7).to_string(), "7");
        assert_eq!(Separator::<u8>::NegInfinity.to_string(), "-inf");
    }
}
