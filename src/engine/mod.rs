//! This module provides the persistent storage engine behind the server.
use crate::protocol::ErrorCode;
use crate::Result;

/// A trait for the basic functionality of the key/value storage engine.
///
/// Engines are cheaply cloneable handles to shared state; the server hands a
/// clone to every connection. `Ok(code)` carries the protocol-level outcome
/// of an operation, while `Err` is reserved for storage faults (mapping or
/// lock failures) from which the engine does not recover.
pub trait StorageEngine: Clone + Send + Sync + 'static {
    /// inserts `key` with `value`
    ///
    /// Returns [`ErrorCode::InsertKeyAlreadyExists`] if the key is present.
    fn ins(&self, key: &str, value: &str) -> Result<ErrorCode>;

    /// replaces the value stored under `key` with `value`
    ///
    /// Returns [`ErrorCode::UpdateKeyNotFound`] if the key is missing and
    /// [`ErrorCode::UpdateValueAlreadyExists`] if the stored value is
    /// byte-identical to `value`.
    fn upd(&self, key: &str, value: &str) -> Result<ErrorCode>;

    /// removes `key` and its value
    ///
    /// Returns [`ErrorCode::DeleteKeyNotFound`] if the key is missing.
    fn del(&self, key: &str) -> Result<ErrorCode>;

    /// reads the value stored under `key`
    ///
    /// On success the returned value accompanies [`ErrorCode::None`]; a
    /// missing key yields [`ErrorCode::GetKeyNotFound`] and an empty value.
    fn get(&self, key: &str) -> Result<(ErrorCode, String)>;

    /// the number of items currently stored
    fn size(&self) -> Result<u64>;
}

mod mapped;

pub use self::mapped::MappedStore;
