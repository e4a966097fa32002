//! Common types and descriptors for GPU resources.
//!
//! This module contains format enums, usage flags, and descriptor structs
//! shared by the backend-agnostic front end and the backend implementations.
//! Nothing here is validated: the front end checks parameters before they
//! reach a backend.

mod binding;
mod buffer;
mod common;
mod texture;

pub use binding::{BindingType, ShaderStage};
pub use buffer::{BufferDescriptor, BufferUsage};
pub use common::Extent3d;
pub use texture::{TextureDescriptor, TextureDimension, TextureFormat, TextureUsage};
