//! bastun-core: shared data model for the bastun tunnel relay.
//!
//! Provides gateway descriptors, resource ids and tunnel targets, access
//! tokens, the control messages and framing spoken with the gateway, the
//! error taxonomy, and the collaborator traits (gateway lookup, credential
//! provider) the relay consumes.

pub mod codec;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod resource;

// Re-export commonly used items at crate root.
pub use codec::{control_frame, data_frame, decode_frame, Frame};
pub use credential::{AccessToken, CredentialProvider, StaticCredential};
pub use error::{TunnelError, TunnelResult};
pub use gateway::{GatewayDescriptor, GatewayLookup, Sku, SkuTier};
pub use messages::{ControlMessage, RejectCode, PROTOCOL_VERSION};
pub use resource::{is_valid_resource_id, parse_port, ResourceId, TargetSpec};
