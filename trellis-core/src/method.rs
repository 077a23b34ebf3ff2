//! Identification of RPC methods.

use serde::Deserialize;

/// Identifies an RPC method by service and method name.
///
/// Descriptors are immutable value types used as lookup keys for per-method
/// configuration and passed to interceptors as part of the call context.
///
/// # Example
///
/// ```
/// use trellis_core::MethodDescriptor;
///
/// let descriptor = MethodDescriptor::new("echo.Echo", "Collect");
/// assert_eq!(descriptor.to_string(), "echo.Echo/Collect");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct MethodDescriptor {
    service: String,
    method: String,
}

impl MethodDescriptor {
    /// Create a new descriptor from a service and method name.
    pub fn new<S: Into<String>, M: Into<String>>(service: S, method: M) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    /// The fully-qualified service name (e.g. "echo.Echo").
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The method name (e.g. "Collect").
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl std::fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}
