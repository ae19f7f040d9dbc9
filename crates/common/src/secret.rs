//! Redacting wrapper for passwords and key secrets

use std::fmt;
use zeroize::Zeroize;

const REDACTED: &str = "[REDACTED]";

/// A password or key secret. Formatting never shows the value and the
/// backing memory is wiped on drop.
#[derive(Clone)]
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the value. Keep the borrow short and out of log fields.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret<String> {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_hides_password() {
        let secret = Secret::from("hunter2");
        assert_eq!(format!("{secret:?}"), REDACTED);
        assert_eq!(format!("{secret}"), REDACTED);

        let nested = format!("{:?}", Some(secret));
        assert!(!nested.contains("hunter2"), "got: {nested}");
    }

    #[test]
    fn clones_expose_the_same_value() {
        let secret: Secret<String> = String::from("hunter2").into();
        let copy = secret.clone();
        drop(secret);
        assert_eq!(copy.expose(), "hunter2");
    }
}
