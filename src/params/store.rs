use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::core::{Result, RuntimeError};
use crate::params::{
    AccessTier, ParamAccessGroup, ParamData, ParamDecl, ParamReadHook, ParamType, ParamValue,
    ParamWriteHook, tier_allows,
};

/// A live parameter cell owned by an instance.
pub struct Parameter {
    name: String,
    ty: ParamType,
    read_group: ParamAccessGroup,
    write_group: ParamAccessGroup,
    // Serializes hook invocations; the value cell has its own lock so hooks
    // can reach it through `ParamData` without re-entering this one.
    op_lock: Mutex<()>,
    value: Mutex<ParamValue>,
    read_hook: Option<Arc<dyn ParamReadHook>>,
    write_hook: Option<Arc<dyn ParamWriteHook>>,
}

impl Parameter {
    fn from_decl(decl: &ParamDecl) -> Self {
        Self {
            name: decl.name.clone(),
            ty: decl.default_value.param_type(),
            read_group: decl.read_group,
            write_group: decl.write_group,
            op_lock: Mutex::new(()),
            value: Mutex::new(decl.default_value),
            read_hook: decl.read_hook.clone(),
            write_hook: decl.write_hook.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_type(&self) -> ParamType {
        self.ty
    }

    pub fn read_group(&self) -> ParamAccessGroup {
        self.read_group
    }

    pub fn write_group(&self) -> ParamAccessGroup {
        self.write_group
    }

    /// Reads the cell, going through the read hook when one is declared.
    /// Authorization happens at the subsystem entry points.
    pub fn read(&self) -> ParamValue {
        let _guard = self.op_lock.lock().unwrap_or_else(|e| e.into_inner());
        match &self.read_hook {
            Some(hook) => hook.read(ParamData::new(&self.value)),
            None => *self.value.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Writes the cell, going through the write hook when one is declared.
    /// Fails on a type mismatch.
    pub fn write(&self, value: ParamValue) -> Result<()> {
        if value.param_type() != self.ty {
            return Err(RuntimeError::InvalidState(format!(
                "parameter '{}' expects {:?}, got {:?}",
                self.name,
                self.ty,
                value.param_type()
            )));
        }
        let _guard = self.op_lock.lock().unwrap_or_else(|e| e.into_inner());
        match &self.write_hook {
            Some(hook) => hook.write(ParamData::new(&self.value), value),
            None => *self.value.lock().unwrap_or_else(|e| e.into_inner()) = value,
        }
        Ok(())
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("type", &self.ty)
            .field("read_group", &self.read_group)
            .field("write_group", &self.write_group)
            .finish()
    }
}

/// Parameter table of a single instance, populated in declaration order.
#[derive(Debug, Default)]
pub struct ParameterStore {
    params: Vec<Arc<Parameter>>,
    by_name: HashMap<String, usize>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, decl: &ParamDecl) -> Result<()> {
        if self.by_name.contains_key(&decl.name) {
            return Err(RuntimeError::AlreadyPresent(format!(
                "parameter '{}'",
                decl.name
            )));
        }
        self.by_name.insert(decl.name.clone(), self.params.len());
        self.params.push(Arc::new(Parameter::from_decl(decl)));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Parameter>> {
        self.by_name.get(name).map(|&idx| &self.params[idx])
    }

    /// Table in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Parameter>> {
        self.params.iter()
    }

    /// Reads `name` on behalf of a caller with the given tier, optionally
    /// checking the cell type first.
    pub fn read_checked(
        &self,
        owner: &str,
        name: &str,
        tier: AccessTier,
        expected: Option<ParamType>,
    ) -> Result<ParamValue> {
        let param = self
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(format!("parameter '{owner}.{name}'")))?;
        if !tier_allows(tier, param.read_group()) {
            return Err(RuntimeError::AccessDenied(format!(
                "read of parameter '{owner}.{name}'"
            )));
        }
        if let Some(ty) = expected
            && ty != param.param_type()
        {
            return Err(RuntimeError::InvalidState(format!(
                "parameter '{owner}.{name}' expects {:?}, got {ty:?}",
                param.param_type()
            )));
        }
        Ok(param.read())
    }

    /// Mirror of [`read_checked`](Self::read_checked) for writes.
    pub fn write_checked(
        &self,
        owner: &str,
        name: &str,
        tier: AccessTier,
        value: ParamValue,
    ) -> Result<()> {
        let param = self
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(format!("parameter '{owner}.{name}'")))?;
        if !tier_allows(tier, param.write_group()) {
            return Err(RuntimeError::AccessDenied(format!(
                "write of parameter '{owner}.{name}'"
            )));
        }
        param.write(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(decl: ParamDecl) -> ParameterStore {
        let mut store = ParameterStore::new();
        store.declare(&decl).unwrap();
        store
    }

    #[test]
    fn table_keeps_declaration_order() {
        let mut store = ParameterStore::new();
        store.declare(&ParamDecl::new("b", ParamValue::U8(0))).unwrap();
        store.declare(&ParamDecl::new("a", ParamValue::U8(0))).unwrap();
        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
        let names: Vec<_> = store.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn declare_rejects_duplicates() {
        let mut store = store_with(ParamDecl::new("p", ParamValue::U32(0)));
        let err = store
            .declare(&ParamDecl::new("p", ParamValue::U32(1)))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyPresent(_)));
    }

    #[test]
    fn defaults_are_visible() {
        let store = store_with(
            ParamDecl::new("p", ParamValue::U32(7)).with_read_group(ParamAccessGroup::Public),
        );
        let value = store
            .read_checked("m", "p", AccessTier::Public, Some(ParamType::U32))
            .unwrap();
        assert_eq!(value, ParamValue::U32(7));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let store = store_with(
            ParamDecl::new("p", ParamValue::U32(7))
                .with_read_group(ParamAccessGroup::Public)
                .with_write_group(ParamAccessGroup::Public),
        );
        assert!(
            store
                .read_checked("m", "p", AccessTier::Public, Some(ParamType::U8))
                .is_err()
        );
        assert!(
            store
                .write_checked("m", "p", AccessTier::Public, ParamValue::I64(1))
                .is_err()
        );
    }

    #[test]
    fn access_groups_are_enforced() {
        let store = store_with(
            ParamDecl::new("p", ParamValue::U32(7))
                .with_read_group(ParamAccessGroup::Dependency)
                .with_write_group(ParamAccessGroup::Private),
        );
        assert!(matches!(
            store.read_checked("m", "p", AccessTier::Public, None),
            Err(RuntimeError::AccessDenied(_))
        ));
        assert!(store.read_checked("m", "p", AccessTier::Dependency, None).is_ok());
        assert!(matches!(
            store.write_checked("m", "p", AccessTier::Dependency, ParamValue::U32(1)),
            Err(RuntimeError::AccessDenied(_))
        ));
        assert!(
            store
                .write_checked("m", "p", AccessTier::Owner, ParamValue::U32(1))
                .is_ok()
        );
    }

    #[test]
    fn hooks_replace_direct_access() {
        let decl = ParamDecl::new("p", ParamValue::U32(1))
            .with_read_group(ParamAccessGroup::Public)
            .with_write_group(ParamAccessGroup::Public)
            .with_read_hook(|data: ParamData<'_>| match data.get() {
                ParamValue::U32(v) => ParamValue::U32(v * 10),
                other => other,
            })
            .with_write_hook(|data: ParamData<'_>, value: ParamValue| {
                if let ParamValue::U32(v) = value {
                    data.set(ParamValue::U32(v + 1));
                }
            });
        let store = store_with(decl);
        store
            .write_checked("m", "p", AccessTier::Public, ParamValue::U32(4))
            .unwrap();
        let value = store.read_checked("m", "p", AccessTier::Public, None).unwrap();
        assert_eq!(value, ParamValue::U32(50));
    }
}
