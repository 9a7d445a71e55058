/// Error codes used across the tool surface. Every failed tool call returns
/// the uniform envelope `{"error": {"code", "message", "detail"?}}` with one
/// of these codes; nothing escapes the tool boundary as a raw fault.
pub mod codes {
    /// Credentials rejected, or the session was rejected twice in a row.
    pub const AUTH_ERROR: &str = "auth_error";
    /// Connection or timeout failure reaching the Magic-API service.
    pub const NETWORK_ERROR: &str = "network_error";
    /// No matching resource, path, or knowledge topic.
    pub const NOT_FOUND: &str = "not_found";
    /// Malformed or missing tool input.
    pub const VALIDATION_ERROR: &str = "validation_error";
    /// Unknown tool identifier.
    pub const NOT_IMPLEMENTED: &str = "not_implemented";
    /// Unexpected upstream response or internal failure.
    pub const INTERNAL_ERROR: &str = "internal_error";
}
