mod def;
mod field;
mod names;
mod registry;

use std::sync::Arc;

pub use def::{GRANT_SPEC, GROUP_SPEC, SchemaDef, SpecDef, USER_SPEC};
pub use field::{Field, FieldKind, ReverseOf};
pub use names::{is_reserved_key, validate_field_name, validate_spec_name};
pub use registry::{Registry, Spec, coerce_value, normalize_datetime};

use crate::calc::CalcIndex;
use crate::error::Result;

/// A fully built schema version: definition, registry and parsed calcs.
///
/// Snapshots are immutable; a schema change builds a new one and swaps the
/// `Arc` held by the engine.
#[derive(Debug)]
pub struct Schema {
    pub def: SchemaDef,
    pub registry: Registry,
    pub calcs: CalcIndex,
}

impl Schema {
    pub fn build(mut def: SchemaDef) -> Result<Arc<Self>> {
        def.ensure_builtins();
        if def.id.is_empty() {
            def.seal();
        }
        let registry = Registry::from_def(&def)?;
        let calcs = CalcIndex::build(&registry)?;
        Ok(Arc::new(Self {
            def,
            registry,
            calcs,
        }))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.def.id
    }
}
