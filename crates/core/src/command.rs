use serde::Serialize;
use serde::de::DeserializeOwned;

/// A request to change an aggregate.
///
/// Commands are serializable so they can be stored and applied later by the
/// scheduler.
pub trait Command: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Name recorded alongside scheduled commands (diagnostics only).
    fn command_name(&self) -> &'static str;
}
