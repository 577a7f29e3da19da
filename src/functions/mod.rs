//! SQL function registry
//!
//! The compiler never runs functions; it needs to resolve a call by name and
//! arity and to read the flags that drive code generation (constant
//! folding, collation forwarding, the LIKE rewrite, aggregate handling).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use lazy_static::lazy_static;

use crate::types::FieldType;

bitflags! {
    /// Properties of a SQL function
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FuncFlags: u32 {
        /// Same arguments always give the same result
        const CONSTANT = 0x0001;
        /// Needs the collation of its arguments
        const NEEDCOLL = 0x0002;
        /// Result collation is the collation of the first argument
        const DERIVEDCOLL = 0x0004;
        /// length(): may read only the value size
        const LENGTH = 0x0008;
        /// typeof(): may read only the value type
        const TYPEOF = 0x0010;
        /// coalesce()/ifnull(): lazily evaluated arguments
        const COALESCE = 0x0020;
        /// unlikely()/likelihood(): a planner hint around one argument
        const UNLIKELY = 0x0040;
        /// like(): candidate for the LIKE-prefix rewrite
        const LIKE = 0x0080;
        /// Case-insensitive like()
        const CASE_INSENSITIVE = 0x0100;
        /// Aggregate function
        const AGGREGATE = 0x0200;
        /// min() aggregate
        const MIN = 0x0400;
        /// max() aggregate
        const MAX = 0x0800;
    }
}

/// Function definition
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDef {
    /// Upper-case function name
    pub name: String,
    /// Number of arguments, -1 for any
    pub n_arg: i32,
    pub flags: FuncFlags,
    /// Result type
    pub returns: FieldType,
    /// Expected argument type (applied to every argument)
    pub param_type: Option<FieldType>,
}

impl FuncDef {
    pub fn new(name: &str, n_arg: i32, flags: FuncFlags, returns: FieldType) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            n_arg,
            flags,
            returns,
            param_type: None,
        }
    }

    pub fn with_param_type(mut self, ty: FieldType) -> Self {
        self.param_type = Some(ty);
        self
    }

    pub fn is_aggregate(&self) -> bool {
        self.flags.contains(FuncFlags::AGGREGATE)
    }

    pub fn accepts(&self, argc: usize) -> bool {
        self.n_arg < 0 || self.n_arg as usize == argc
    }
}

fn builtin_functions() -> Vec<FuncDef> {
    use FieldType as T;
    use FuncFlags as F;
    let c = F::CONSTANT;
    vec![
        // aggregates
        FuncDef::new("count", 0, F::AGGREGATE, T::Integer),
        FuncDef::new("count", 1, F::AGGREGATE, T::Integer),
        FuncDef::new("sum", 1, F::AGGREGATE, T::Number).with_param_type(T::Number),
        FuncDef::new("total", 1, F::AGGREGATE, T::Double).with_param_type(T::Number),
        FuncDef::new("avg", 1, F::AGGREGATE, T::Number).with_param_type(T::Number),
        FuncDef::new("min", 1, F::AGGREGATE | F::NEEDCOLL | F::MIN, T::Scalar),
        FuncDef::new("max", 1, F::AGGREGATE | F::NEEDCOLL | F::MAX, T::Scalar),
        FuncDef::new("group_concat", -1, F::AGGREGATE, T::String),
        // scalar
        FuncDef::new("abs", 1, c, T::Number).with_param_type(T::Number),
        FuncDef::new("length", 1, c | F::LENGTH, T::Integer),
        FuncDef::new("char_length", 1, c | F::LENGTH, T::Integer),
        FuncDef::new("typeof", 1, c | F::TYPEOF, T::String),
        FuncDef::new("coalesce", -1, c | F::COALESCE, T::Scalar),
        FuncDef::new("ifnull", 2, c | F::COALESCE, T::Scalar),
        FuncDef::new("nullif", 2, c | F::NEEDCOLL, T::Scalar),
        FuncDef::new("unlikely", 1, c | F::UNLIKELY, T::Boolean),
        FuncDef::new("likely", 1, c | F::UNLIKELY, T::Boolean),
        FuncDef::new("likelihood", 2, c | F::UNLIKELY, T::Boolean),
        FuncDef::new("like", 2, c | F::LIKE | F::NEEDCOLL | F::CASE_INSENSITIVE, T::Boolean),
        FuncDef::new("like", 3, c | F::LIKE | F::NEEDCOLL | F::CASE_INSENSITIVE, T::Boolean),
        FuncDef::new("upper", 1, c | F::DERIVEDCOLL, T::String),
        FuncDef::new("lower", 1, c | F::DERIVEDCOLL, T::String),
        FuncDef::new("trim", -1, c | F::DERIVEDCOLL, T::String),
        FuncDef::new("substr", -1, c | F::DERIVEDCOLL, T::String),
        FuncDef::new("replace", 3, c | F::DERIVEDCOLL, T::String),
        FuncDef::new("round", -1, c, T::Double),
        FuncDef::new("hex", 1, c, T::String),
        FuncDef::new("quote", 1, c, T::String),
        FuncDef::new("printf", -1, c, T::String),
        FuncDef::new("random", 0, F::empty(), T::Integer),
        FuncDef::new("randomblob", 1, F::empty(), T::Varbinary),
    ]
}

lazy_static! {
    static ref FUNCTIONS: Mutex<HashMap<String, Vec<Arc<FuncDef>>>> = {
        let mut map: HashMap<String, Vec<Arc<FuncDef>>> = HashMap::new();
        for def in builtin_functions() {
            map.entry(normalize_name(&def.name))
                .or_default()
                .push(Arc::new(def));
        }
        Mutex::new(map)
    };
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Register (or override) a function definition
pub fn register_function(def: FuncDef) -> Arc<FuncDef> {
    let def = Arc::new(def);
    let mut registry = FUNCTIONS.lock().unwrap_or_else(|e| e.into_inner());
    let slot = registry.entry(normalize_name(&def.name)).or_default();
    slot.retain(|d| d.n_arg != def.n_arg);
    slot.push(Arc::clone(&def));
    def
}

/// Resolve a function by name and argument count. An exact arity match is
/// preferred over a variadic definition.
pub fn find_function(name: &str, argc: usize) -> Option<Arc<FuncDef>> {
    let registry = FUNCTIONS.lock().unwrap_or_else(|e| e.into_inner());
    let defs = registry.get(&normalize_name(name))?;
    defs.iter()
        .find(|d| d.n_arg >= 0 && d.n_arg as usize == argc)
        .or_else(|| defs.iter().find(|d| d.n_arg < 0))
        .cloned()
}

/// Flags of a function call, empty when the function is unknown.
pub fn function_flags(name: &str, argc: usize) -> FuncFlags {
    find_function(name, argc)
        .map(|d| d.flags)
        .unwrap_or_else(FuncFlags::empty)
}

pub fn is_aggregate_function(name: &str, argc: usize) -> bool {
    function_flags(name, argc).contains(FuncFlags::AGGREGATE)
}
