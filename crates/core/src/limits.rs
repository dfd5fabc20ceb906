//! Size limits enforced by the session layer.

/// Hard cap on a single user document: 16 MiB.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Cap on internal documents, which may carry bookkeeping on top of user
/// payload. The in-memory operation buffer of a multi-statement
/// transaction is bounded by this value; the serialized form carries
/// extra overhead, so the commit itself can still reject a transaction
/// that squeaked under this cap.
pub const MAX_INTERNAL_DOCUMENT_SIZE: usize = MAX_DOCUMENT_SIZE + 16 * 1024;
