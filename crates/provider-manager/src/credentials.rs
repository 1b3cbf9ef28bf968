//! Credential pools

use std::fmt;

/// Ordered credentials for one provider, rotated round-robin
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialPool {
    keys: Vec<String>,
}

impl CredentialPool {
    /// Creates a pool, dropping blank entries
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(Into::into)
                .filter(|key| !key.trim().is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Credential at `cursor mod len`, `None` for an empty pool
    pub fn at(&self, cursor: usize) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }

        Some(self.keys[cursor % self.keys.len()].as_str())
    }
}

// Credentials never reach logs
impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("len", &self.keys.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_wraps() {
        let pool = CredentialPool::new(["a", "b", "c"]);

        let drawn: Vec<_> = (0..7).filter_map(|i| pool.at(i)).collect();
        assert_eq!(drawn, vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn test_blank_keys_dropped_and_redacted() {
        let pool = CredentialPool::new(vec!["secret".to_string(), "  ".to_string()]);

        assert_eq!(pool.len(), 1);
        assert!(!format!("{:?}", pool).contains("secret"));
        assert_eq!(CredentialPool::default().at(3), None);
    }
}
