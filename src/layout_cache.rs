//! Structurally keyed bind group layout cache.
//!
//! Bind group layouts are compared and deduplicated by the structure of their
//! binding slots, not by identity: two layouts with identical slot tables
//! share one [`BindGroupLayout`] instance. Deduplication is an optimization
//! for the front end; nothing in the synchronization core relies on it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{BindingType, ShaderStage};

/// Maximum number of binding slots in one bind group.
pub const MAX_BINDINGS_PER_GROUP: usize = 16;

/// One occupied binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    /// Shader stages the binding is visible to.
    pub visibility: ShaderStage,
    /// Kind of resource bound in the slot.
    pub binding_type: BindingType,
}

/// Structural fingerprint of a bind group layout.
///
/// Equality and hashing cover the full slot table, so this is usable as a
/// cache key for uniquing layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BindGroupLayoutInfo {
    bindings: [Option<LayoutBinding>; MAX_BINDINGS_PER_GROUP],
}

impl BindGroupLayoutInfo {
    /// Create an empty layout description.
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe slots `[start, start + count)` as holding `binding_type`
    /// visible to `visibility`.
    pub fn set_bindings(
        &mut self,
        visibility: ShaderStage,
        binding_type: BindingType,
        start: usize,
        count: usize,
    ) {
        for slot in &mut self.bindings[start..start + count] {
            *slot = Some(LayoutBinding {
                visibility,
                binding_type,
            });
        }
    }

    /// The binding in `slot`, if the slot is occupied.
    pub fn binding(&self, slot: usize) -> Option<LayoutBinding> {
        self.bindings[slot]
    }

    /// Number of occupied slots.
    pub fn binding_count(&self) -> usize {
        self.bindings.iter().filter(|b| b.is_some()).count()
    }
}

/// A uniqued bind group layout.
#[derive(Debug)]
pub struct BindGroupLayout {
    info: BindGroupLayoutInfo,
}

impl BindGroupLayout {
    fn new(info: BindGroupLayoutInfo) -> Self {
        Self { info }
    }

    /// The structural description this layout was built from.
    pub fn info(&self) -> &BindGroupLayoutInfo {
        &self.info
    }
}

/// Cache sharing [`BindGroupLayout`] instances between structurally equal
/// requests.
#[derive(Debug, Default)]
pub struct BindGroupLayoutCache {
    cache: RwLock<HashMap<BindGroupLayoutInfo, Arc<BindGroupLayout>>>,
}

impl BindGroupLayoutCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the layout for the given structural description.
    pub fn get_or_create(&self, info: BindGroupLayoutInfo) -> Arc<BindGroupLayout> {
        // Fast path: read lock
        if let Some(layout) = self.cache.read().get(&info) {
            return Arc::clone(layout);
        }

        // Slow path: write lock
        let mut cache = self.cache.write();
        cache
            .entry(info)
            .or_insert_with(|| Arc::new(BindGroupLayout::new(info)))
            .clone()
    }

    /// Number of distinct layouts currently cached.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampled_fragment_layout() -> BindGroupLayoutInfo {
        let mut info = BindGroupLayoutInfo::new();
        info.set_bindings(ShaderStage::FRAGMENT, BindingType::SampledTexture, 0, 1);
        info.set_bindings(ShaderStage::FRAGMENT, BindingType::Sampler, 1, 1);
        info
    }

    #[test]
    fn test_equal_structure_shares_one_layout() {
        let cache = BindGroupLayoutCache::new();
        let first = cache.get_or_create(sampled_fragment_layout());
        let second = cache.get_or_create(sampled_fragment_layout());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_different_structure_gets_new_layout() {
        let cache = BindGroupLayoutCache::new();
        let sampled = cache.get_or_create(sampled_fragment_layout());

        let mut uniform = BindGroupLayoutInfo::new();
        uniform.set_bindings(ShaderStage::VERTEX, BindingType::UniformBuffer, 0, 1);
        let uniform = cache.get_or_create(uniform);

        assert!(!Arc::ptr_eq(&sampled, &uniform));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_fingerprint_covers_all_slots() {
        let mut a = BindGroupLayoutInfo::new();
        a.set_bindings(ShaderStage::VERTEX, BindingType::UniformBuffer, 0, 2);
        let mut b = BindGroupLayoutInfo::new();
        b.set_bindings(ShaderStage::VERTEX, BindingType::UniformBuffer, 0, 1);
        b.set_bindings(ShaderStage::FRAGMENT, BindingType::UniformBuffer, 1, 1);

        assert_ne!(a, b);
        assert_eq!(a.binding_count(), 2);
    }
}
