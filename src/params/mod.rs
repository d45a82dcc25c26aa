//! Typed, access-controlled module parameters.

pub mod store;

use std::fmt;
use std::sync::Arc;

pub use store::{Parameter, ParameterStore};

/// Data type of a parameter cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

/// Who may read or write a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamAccessGroup {
    /// Any caller.
    Public,
    /// The owning module and modules that depend on it.
    Dependency,
    /// Only the owning module.
    Private,
}

/// The relationship a caller has to the parameter's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTier {
    Public,
    Dependency,
    Owner,
}

/// Authorization matrix: a tier unlocks its own group and every group below.
pub fn tier_allows(tier: AccessTier, group: ParamAccessGroup) -> bool {
    match group {
        ParamAccessGroup::Public => true,
        ParamAccessGroup::Dependency => {
            matches!(tier, AccessTier::Dependency | AccessTier::Owner)
        }
        ParamAccessGroup::Private => matches!(tier, AccessTier::Owner),
    }
}

/// A parameter value together with its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            Self::U8(_) => ParamType::U8,
            Self::U16(_) => ParamType::U16,
            Self::U32(_) => ParamType::U32,
            Self::U64(_) => ParamType::U64,
            Self::I8(_) => ParamType::I8,
            Self::I16(_) => ParamType::I16,
            Self::I32(_) => ParamType::I32,
            Self::I64(_) => ParamType::I64,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
        }
    }
}

/// Raw accessor handed to hooks so they can reach the underlying cell
/// without going through the access checks again.
pub struct ParamData<'a> {
    cell: &'a std::sync::Mutex<ParamValue>,
}

impl<'a> ParamData<'a> {
    pub(crate) fn new(cell: &'a std::sync::Mutex<ParamValue>) -> Self {
        Self { cell }
    }

    pub fn get(&self) -> ParamValue {
        *self.cell.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, value: ParamValue) {
        *self.cell.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

/// Hook substituted for a direct cell read.
///
/// Hooks run under the calling task while the parameter's operation lock is
/// held. They must not call back into the registry and must not block.
pub trait ParamReadHook: Send + Sync {
    fn read(&self, data: ParamData<'_>) -> ParamValue;
}

/// Hook substituted for a direct cell write.
pub trait ParamWriteHook: Send + Sync {
    fn write(&self, data: ParamData<'_>, value: ParamValue);
}

impl<F> ParamReadHook for F
where
    F: Fn(ParamData<'_>) -> ParamValue + Send + Sync,
{
    fn read(&self, data: ParamData<'_>) -> ParamValue {
        self(data)
    }
}

impl<F> ParamWriteHook for F
where
    F: Fn(ParamData<'_>, ParamValue) + Send + Sync,
{
    fn write(&self, data: ParamData<'_>, value: ParamValue) {
        self(data, value)
    }
}

/// Declaration of a single parameter inside an export descriptor.
#[derive(Clone)]
pub struct ParamDecl {
    pub name: String,
    pub default_value: ParamValue,
    pub read_group: ParamAccessGroup,
    pub write_group: ParamAccessGroup,
    pub read_hook: Option<Arc<dyn ParamReadHook>>,
    pub write_hook: Option<Arc<dyn ParamWriteHook>>,
}

impl ParamDecl {
    pub fn new(name: impl Into<String>, default_value: ParamValue) -> Self {
        Self {
            name: name.into(),
            default_value,
            read_group: ParamAccessGroup::Private,
            write_group: ParamAccessGroup::Private,
            read_hook: None,
            write_hook: None,
        }
    }

    pub fn with_read_group(mut self, group: ParamAccessGroup) -> Self {
        self.read_group = group;
        self
    }

    pub fn with_write_group(mut self, group: ParamAccessGroup) -> Self {
        self.write_group = group;
        self
    }

    pub fn with_read_hook(mut self, hook: impl ParamReadHook + 'static) -> Self {
        self.read_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_write_hook(mut self, hook: impl ParamWriteHook + 'static) -> Self {
        self.write_hook = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ParamDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamDecl")
            .field("name", &self.name)
            .field("default_value", &self.default_value)
            .field("read_group", &self.read_group)
            .field("write_group", &self.write_group)
            .field("read_hook", &self.read_hook.is_some())
            .field("write_hook", &self.write_hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_matrix() {
        let table = [
            (AccessTier::Public, [true, false, false]),
            (AccessTier::Dependency, [true, true, false]),
            (AccessTier::Owner, [true, true, true]),
        ];
        for (tier, expected) in table {
            assert_eq!(tier_allows(tier, ParamAccessGroup::Public), expected[0]);
            assert_eq!(tier_allows(tier, ParamAccessGroup::Dependency), expected[1]);
            assert_eq!(tier_allows(tier, ParamAccessGroup::Private), expected[2]);
        }
    }

    #[test]
    fn value_carries_its_type() {
        assert_eq!(ParamValue::U32(7).param_type(), ParamType::U32);
        assert_eq!(ParamValue::I8(-1).param_type(), ParamType::I8);
    }
}
