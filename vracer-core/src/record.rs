//! Records of training metrics.
use crate::error::VracerError;
use chrono::prelude::{DateTime, Local};
use std::collections::{hash_map::Iter, HashMap};

/// Represents possible types of values in a [`Record`].
#[derive(Debug, Clone)]
pub enum RecordValue {
    /// Scalar, usually a metric of a policy update.
    Scalar(f32),

    /// Date and time.
    DateTime(DateTime<Local>),

    /// A sequence of scalars.
    Array1(Vec<f32>),

    /// String.
    String(String),
}

/// Represents a record, a key-value store of training metrics.
///
/// The learner emits one record per policy update; the trainer merges these
/// with generation-level values before logging them.
#[derive(Debug, Clone)]
pub struct Record(HashMap<String, RecordValue>);

impl Record {
    /// Construct empty record.
    pub fn empty() -> Self {
        Self(HashMap::new())
    }

    /// Create a record from a slice of key-value pairs.
    pub fn from_slice<K: Into<String> + Clone>(s: &[(K, RecordValue)]) -> Self {
        Self(
            s.iter()
                .map(|(k, v)| (k.clone().into(), v.clone()))
                .collect(),
        )
    }

    /// Get keys.
    pub fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }

    /// Insert a key-value pair into the record.
    pub fn insert(&mut self, k: impl Into<String>, v: RecordValue) {
        self.0.insert(k.into(), v);
    }

    /// Return an iterator over key-value pairs in the record.
    pub fn iter(&self) -> Iter<'_, String, RecordValue> {
        self.0.iter()
    }

    /// Get the value of the given key.
    pub fn get(&self, k: &str) -> Option<&RecordValue> {
        self.0.get(k)
    }

    /// Returns true if the record is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge records, the given record having priority on key conflicts.
    pub fn merge(self, record: Record) -> Self {
        Record(self.0.into_iter().chain(record.0).collect())
    }

    /// Merge the given record into the record.
    pub fn merge_inplace(&mut self, record: Record) {
        for (k, v) in record.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Get scalar value.
    ///
    /// * `key` - The key of an entry in the record.
    pub fn get_scalar(&self, k: &str) -> Result<f32, VracerError> {
        if let Some(v) = self.0.get(k) {
            match v {
                RecordValue::Scalar(v) => Ok(*v as _),
                _ => Err(VracerError::Config(format!(
                    "record value of key {} is not a scalar",
                    k
                ))),
            }
        } else {
            Err(VracerError::Config(format!("record key not found: {}", k)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Record, RecordValue::Scalar};

    #[test]
    fn test_merge() {
        let mut r1 = Record::from_slice(&[("a", Scalar(0.1)), ("b", Scalar(0.2))]);
        let r2 = Record::from_slice(&[("b", Scalar(0.3)), ("c", Scalar(0.4))]);
        r1.merge_inplace(r2);

        assert_eq!(r1.get_scalar("a").unwrap(), 0.1);
        assert_eq!(r1.get_scalar("b").unwrap(), 0.3);
        assert_eq!(r1.get_scalar("c").unwrap(), 0.4);
    }
}
