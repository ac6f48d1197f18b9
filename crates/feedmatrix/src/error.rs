// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types and the fatal-error policy.
//!
//! Contract violations by the caller (unknown record, reserved cipher, ...)
//! are reported through [`Error`] and leave every structure untouched.
//! Corruption of internal invariants is not recoverable and goes through
//! [`fatal`], which logs the diagnostic and then either aborts the process
//! or unwinds with a [`FatalError`] payload, depending on [`FatalPolicy`].

use std::sync::atomic::{AtomicU8, Ordering};

/// Errors reported by the public API.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Contract Errors
    // ========================================================================
    /// Record name or id is not part of the scheme.
    UnknownRecord(String),
    /// Non-zero cipher value without the valid-cipher marker.
    ReservedCipher(i32),
    /// Temporal contract requires a record that carries time.
    RecordWithoutTime(String),
    /// Time value not acceptable for the operation.
    InvalidTime(i64),
    /// Operation on an agent that is closed or closing.
    AgentClosed(usize),
    /// Operation needs a collector of the other contract.
    Unsupported(&'static str),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration value out of range.
    InvalidConfig(String),
    /// Configuration file not found at specified path.
    ConfigFileNotFound(String),
    /// Configuration document could not be parsed.
    ConfigParse(String),

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Listener callback failed.
    Listener(String),
    /// I/O error with underlying cause.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnknownRecord(name) => write!(f, "Unknown record: {}", name),
            Error::ReservedCipher(cipher) => write!(f, "Reserved cipher: {:#x}", cipher),
            Error::RecordWithoutTime(name) => write!(f, "Record {} does not have time", name),
            Error::InvalidTime(time) => write!(f, "Invalid time: {}", time),
            Error::AgentClosed(number) => write!(f, "Agent #{} is closed", number),
            Error::Unsupported(op) => write!(f, "Operation {} needs a history collector", op),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::ConfigFileNotFound(path) => write!(f, "Config file not found: {}", path),
            Error::ConfigParse(msg) => write!(f, "Failed to parse configuration: {}", msg),
            Error::Listener(msg) => write!(f, "Listener failed: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for API results using the public `Error` type.
pub type Result<T> = core::result::Result<T, Error>;

/// What to do once an internal invariant is found broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config-loaders", derive(serde::Deserialize))]
#[cfg_attr(feature = "config-loaders", serde(rename_all = "snake_case"))]
pub enum FatalPolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Log and unwind with a [`FatalError`] payload.
    Panic,
}

/// Panic payload raised under [`FatalPolicy::Panic`].
#[derive(Debug, Clone)]
pub struct FatalError {
    /// Component that detected the corruption.
    pub context: String,
    /// Diagnostic message.
    pub message: String,
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fatal error in {}: {}", self.context, self.message)
    }
}

impl std::error::Error for FatalError {}

const POLICY_ABORT: u8 = 0;
const POLICY_PANIC: u8 = 1;

/// Shared fatal-error switch owned by a collector.
///
/// Every component that may detect corruption holds a clone of the owning
/// collector's handle, so two collectors in one process can use different
/// policies.
#[derive(Debug)]
pub struct FatalHandler {
    policy: AtomicU8,
    owner: String,
}

impl FatalHandler {
    pub fn new(owner: impl Into<String>, policy: FatalPolicy) -> Self {
        let handler = Self {
            policy: AtomicU8::new(POLICY_ABORT),
            owner: owner.into(),
        };
        handler.set_policy(policy);
        handler
    }

    pub fn set_policy(&self, policy: FatalPolicy) {
        let raw = match policy {
            FatalPolicy::Abort => POLICY_ABORT,
            FatalPolicy::Panic => POLICY_PANIC,
        };
        self.policy.store(raw, Ordering::Relaxed);
    }

    pub fn policy(&self) -> FatalPolicy {
        match self.policy.load(Ordering::Relaxed) {
            POLICY_PANIC => FatalPolicy::Panic,
            _ => FatalPolicy::Abort,
        }
    }

    /// Reports broken invariant and never returns.
    #[cold]
    #[track_caller]
    pub fn fatal(&self, message: impl Into<String>) -> ! {
        fatal(self.policy(), &self.owner, message)
    }
}

/// Logs the diagnostic and terminates according to `policy`.
#[cold]
#[track_caller]
pub fn fatal(policy: FatalPolicy, context: &str, message: impl Into<String>) -> ! {
    let message = message.into();
    let location = std::panic::Location::caller();
    log::error!(
        "[FATAL] {}: {} (at {}:{})",
        context,
        message,
        location.file(),
        location.line()
    );
    match policy {
        FatalPolicy::Abort => std::process::abort(),
        FatalPolicy::Panic => std::panic::panic_any(FatalError {
            context: context.to_string(),
            message,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::ReservedCipher(0x10).to_string(),
            "Reserved cipher: 0x10"
        );
        assert_eq!(
            Error::UnknownRecord("Trade".into()).to_string(),
            "Unknown record: Trade"
        );
    }

    #[test]
    fn test_panic_policy_unwinds_with_payload() {
        let handler = FatalHandler::new("test", FatalPolicy::Panic);
        let result = std::panic::catch_unwind(|| handler.fatal("broken chain"));
        let payload = result.expect_err("fatal must not return");
        let fatal = payload
            .downcast_ref::<FatalError>()
            .expect("payload is FatalError");
        assert_eq!(fatal.context, "test");
        assert_eq!(fatal.message, "broken chain");
    }

    #[test]
    fn test_policy_switch() {
        let handler = FatalHandler::new("x", FatalPolicy::Abort);
        assert_eq!(handler.policy(), FatalPolicy::Abort);
        handler.set_policy(FatalPolicy::Panic);
        assert_eq!(handler.policy(), FatalPolicy::Panic);
    }
}
