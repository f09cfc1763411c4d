use std::any::{type_name, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::observability::lock_unpoisoned;

pub const MAX_ASSET_NAME_LEN: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId(u64);

impl AssetId {
    pub const INVALID: AssetId = AssetId(0);

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "asset#{}", self.0)
        } else {
            write!(f, "asset#invalid")
        }
    }
}

/// Hands out asset ids. Ids are never reused, so a stale id can only miss.
#[derive(Debug)]
pub struct AssetIdAllocator {
    next: Mutex<u64>,
}

impl AssetIdAllocator {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(1),
        }
    }

    pub fn allocate(&self) -> AssetId {
        let mut next = lock_unpoisoned(&self.next);
        let id = AssetId(*next);
        *next += 1;
        id
    }
}

impl Default for AssetIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AssetNameError {
    message: String,
}

impl AssetNameError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A validated asset path such as `sprites/hero.sheet`.
#[derive(Clone, Debug)]
pub struct AssetName {
    path: String,
    hash: u64,
}

impl AssetName {
    pub fn new(input: &str) -> Result<Self, AssetNameError> {
        let path = input.trim();
        if path.is_empty() {
            return Err(AssetNameError::new("asset name is empty"));
        }
        if path.contains('\\') {
            return Err(AssetNameError::new("asset name must use '/' separators"));
        }
        if path.len() > MAX_ASSET_NAME_LEN {
            return Err(AssetNameError::new(format!(
                "asset name length {} exceeds max {}",
                path.len(),
                MAX_ASSET_NAME_LEN
            )));
        }
        if !is_valid_path(path) {
            return Err(AssetNameError::new(format!("invalid asset name '{}'", path)));
        }
        Ok(Self {
            path: path.to_string(),
            hash: fnv1a64(path.as_bytes()),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn hash64(&self) -> u64 {
        self.hash
    }

    /// Resolves `relative` against this name's directory, the way a texture
    /// descriptor names the image next to it.
    pub fn sibling(&self, relative: &str) -> Result<AssetName, AssetNameError> {
        match self.path.rsplit_once('/') {
            Some((dir, _)) => AssetName::new(&format!("{}/{}", dir, relative.trim())),
            None => AssetName::new(relative),
        }
    }
}

impl PartialEq for AssetName {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.path == other.path
    }
}

impl Eq for AssetName {}

impl Hash for AssetName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for AssetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl TryFrom<&str> for AssetName {
    type Error = AssetNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        AssetName::new(value)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AssetType {
    id: TypeId,
    name: &'static str,
}

impl AssetType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: short_type_name(type_name::<T>()),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for AssetType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AssetType {}

impl Hash for AssetType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Deduplication identity: the same name requested as two different types
/// yields two different assets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssetKey {
    name: AssetName,
    ty: AssetType,
}

impl AssetKey {
    pub fn new(name: AssetName, ty: AssetType) -> Self {
        Self { name, ty }
    }

    pub fn of<T: 'static>(name: AssetName) -> Self {
        Self::new(name, AssetType::of::<T>())
    }

    pub fn name(&self) -> &AssetName {
        &self.name
    }

    pub fn asset_type(&self) -> AssetType {
        self.ty
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ty.name, self.name)
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn is_valid_path(value: &str) -> bool {
    for segment in value.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return false;
        }
    }
    value.chars().all(|ch| {
        ch.is_ascii_alphanumeric() || ch == '/' || ch == '_' || ch == '-' || ch == '.'
    })
}

fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Mesh;
    struct Sound;

    #[test]
    fn name_trims_whitespace() {
        let name = AssetName::new("  sprites/hero.png ").unwrap();
        assert_eq!(name.as_str(), "sprites/hero.png");
    }

    #[test]
    fn name_rejects_backslashes() {
        let err = AssetName::new("sprites\\hero.png").unwrap_err();
        assert!(err.to_string().contains("'/' separators"));
    }

    #[test]
    fn name_rejects_double_slash_and_dot_segments() {
        assert!(AssetName::new("sprites//hero.png").is_err());
        assert!(AssetName::new("sprites/../hero.png").is_err());
        assert!(AssetName::new("./hero.png").is_err());
    }

    #[test]
    fn name_rejects_overlong_input() {
        let long = "a".repeat(MAX_ASSET_NAME_LEN + 1);
        let err = AssetName::new(&long).unwrap_err();
        assert!(err.to_string().contains("exceeds max"));
    }

    #[test]
    fn sibling_resolves_next_to_name() {
        let name = AssetName::new("textures/hero.texture").unwrap();
        assert_eq!(name.sibling("hero.png").unwrap().as_str(), "textures/hero.png");
        let flat = AssetName::new("hero.texture").unwrap();
        assert_eq!(flat.sibling("hero.png").unwrap().as_str(), "hero.png");
    }

    #[test]
    fn keys_differ_by_type() {
        let name = AssetName::new("shared/name").unwrap();
        let mesh = AssetKey::of::<Mesh>(name.clone());
        let sound = AssetKey::of::<Sound>(name.clone());
        assert_ne!(mesh, sound);
        let mut set = HashSet::new();
        set.insert(mesh.clone());
        set.insert(AssetKey::of::<Mesh>(name));
        assert_eq!(set.len(), 1);
        assert_eq!(mesh.to_string(), "Mesh:shared/name");
    }

    #[test]
    fn allocator_is_monotonic() {
        let allocator = AssetIdAllocator::new();
        let first = allocator.allocate();
        let second = allocator.allocate();
        assert!(first.is_valid());
        assert!(second > first);
    }
}
