//! The process-wide registry of unboxing accessors.
//!
//! When a custom host object must be unboxed into a basic D-Bus type, the
//! bridge consults this table for a selector that yields the right scalar.
//! The registry is read-mostly and guarded by a mutex; readers copy the
//! bindings out. Initialisation and teardown are explicit so tests can reset
//! the state - there is no lazy setup on first use.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::typebridge::TypeCode;
use crate::{Error, ErrorKind};

static ACCESSORS: Mutex<Option<BTreeMap<String, TypeCode>>> = Mutex::new(None);

/// Initialises the registry. Idempotent.
pub fn init() {
    let mut g = ACCESSORS.lock().unwrap();
    if g.is_none() {
        *g = Some(BTreeMap::new());
    }
}

/// Tears the registry down, dropping all bindings.
pub fn teardown() {
    *ACCESSORS.lock().unwrap() = None;
}

/// Registers `selector` as an unboxing accessor for the given basic type.
///
/// The selector must name a niladic method whose result fits in a 64-bit
/// slot. Fails if the registry has not been initialised or the code is a
/// container type.
pub fn register_unboxing_selector(selector: &str, code: TypeCode) -> Result<(), Error> {
    if code.is_container() {
        return Err(Error::new(ErrorKind::TypeMismatch,
            format!("cannot register accessor '{}' for container type", selector)));
    }
    let mut g = ACCESSORS.lock().unwrap();
    match g.as_mut() {
        Some(map) => {
            map.insert(selector.to_string(), code);
            Ok(())
        }
        None => Err(Error::new(ErrorKind::TypeMismatch,
            "accessor registry used before init".to_string())),
    }
}

/// Copies out the selectors registered for the given type code.
pub fn selectors_for(code: TypeCode) -> Vec<String> {
    let g = ACCESSORS.lock().unwrap();
    match g.as_ref() {
        Some(map) => map.iter()
            .filter(|&(_, &c)| c == code)
            .map(|(s, _)| s.clone())
            .collect(),
        None => Vec::new(),
    }
}

// Tests touching the registry run in parallel threads; they serialize on
// this so init/teardown cycles do not interleave.
#[cfg(test)]
pub(crate) static TEST_GUARD: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let _g = TEST_GUARD.lock().unwrap();
        teardown();
        assert!(register_unboxing_selector("unix_timestamp", TypeCode::Int64).is_err());
        init();
        register_unboxing_selector("unix_timestamp", TypeCode::Int64).unwrap();
        assert_eq!(selectors_for(TypeCode::Int64), vec!["unix_timestamp".to_string()]);
        assert!(selectors_for(TypeCode::Byte).is_empty());
        assert!(register_unboxing_selector("items", TypeCode::Array).is_err());
        teardown();
        assert!(selectors_for(TypeCode::Int64).is_empty());
    }
}
