pub mod capability;
pub mod client;
pub mod transport;
pub mod types;

pub use capability::{CapabilityCache, CapabilityRecord};
pub use client::{HttpProvider, ProviderApi};
pub use transport::{ProviderError, ProviderErrorKind, Transport};
pub use types::{BatchInfo, ModelInfo, ResponseEnvelope, ResponsesRequest, Usage};
