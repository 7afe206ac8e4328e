//! MFA projection of the externally owned user record.
//!
//! The identity subsystem owns the `users` table; this core reads and
//! updates exactly two columns on it.

use crate::models::MfaMethod;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserMfa {
    pub mfa_enabled: bool,
    pub mfa_methods: Vec<MfaMethod>,
}

impl UserMfa {
    pub fn has_method(&self, method: MfaMethod) -> bool {
        self.mfa_methods.contains(&method)
    }

    /// Add a method, keeping the set free of duplicates.
    pub fn add_method(&mut self, method: MfaMethod) {
        if !self.has_method(method) {
            self.mfa_methods.push(method);
        }
        self.mfa_enabled = true;
    }

    /// Remove a method; clears `mfa_enabled` when none remain.
    pub fn remove_method(&mut self, method: MfaMethod) {
        self.mfa_methods.retain(|m| *m != method);
        if self.mfa_methods.is_empty() {
            self.mfa_enabled = false;
        }
    }
}
