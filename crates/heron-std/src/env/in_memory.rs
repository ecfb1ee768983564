use std::cell::RefCell;
use std::collections::HashMap;
use std::env::VarError;

use super::ReadEnv;

/// In-memory test double for [`ReadEnv`].
///
/// Backed by `RefCell<HashMap>`, so not `Send + Sync`; intended for
/// single-threaded test bodies.
#[derive(Default)]
pub struct InMemoryEnv {
    vars: RefCell<HashMap<String, String>>,
}

impl InMemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.vars
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    pub fn unset(&self, key: &str) {
        self.vars.borrow_mut().remove(key);
    }
}

impl ReadEnv for InMemoryEnv {
    fn var(&self, key: &str) -> Result<String, VarError> {
        self.vars
            .borrow()
            .get(key)
            .cloned()
            .ok_or(VarError::NotPresent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_var_returns_value() {
        let env = InMemoryEnv::new();
        env.set("KEY", "value");
        assert_eq!(env.var("KEY").unwrap(), "value");
    }

    #[test]
    fn missing_key_is_not_present() {
        let env = InMemoryEnv::new();
        assert!(matches!(env.var("MISSING"), Err(VarError::NotPresent)));
    }

    #[test]
    fn unset_removes_value() {
        let env = InMemoryEnv::new();
        env.set("KEY", "value");
        env.unset("KEY");
        assert!(env.var("KEY").is_err());
    }

    #[test]
    fn set_overwrites_previous_value() {
        let env = InMemoryEnv::new();
        env.set("KEY", "old");
        env.set("KEY", "new");
        assert_eq!(env.var("KEY").unwrap(), "new");
    }
}
