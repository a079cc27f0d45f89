//! Import guard.
//!
//! Installed as the engine's only module resolver, so plain imports, aliased
//! imports, and imports inside `eval`'d text all pass through `resolve`.
use crate::config::policy::PermissionList;
use crate::worker::classify::Interrupt;
use crate::worker::modules;
use rhai::{Engine, EvalAltResult, Module, ModuleResolver, Position, Shared};

pub struct ImportGuard {
    imports: PermissionList,
}

impl ImportGuard {
    pub fn new(imports: PermissionList) -> Self {
        if !imports.is_allow_list() {
            log::warn!(
                "import block-list in use; every module not named in it stays importable"
            );
        }
        Self { imports }
    }

    /// Check a module name against the policy and build it from the catalog.
    pub fn load(&self, path: &str, pos: Position) -> Result<Module, Box<EvalAltResult>> {
        if !self.imports.permits(path) {
            log::info!("import of '{path}' blocked by policy");
            return Err(Interrupt::ImportBlocked(path.to_string()).into_error());
        }
        modules::build_module(path)
            .ok_or_else(|| EvalAltResult::ErrorModuleNotFound(path.to_string(), pos).into())
    }
}

impl ModuleResolver for ImportGuard {
    fn resolve(
        &self,
        _engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        self.load(path, pos).map(Shared::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ErrorKind;
    use crate::worker::classify::{classify_runtime_error, Outcome};

    fn kind_of(err: &EvalAltResult) -> ErrorKind {
        match classify_runtime_error(err, &[], &[]) {
            Outcome::Failed(kind, _) => kind,
            Outcome::Finished => panic!("expected a failure"),
        }
    }

    #[test]
    fn allow_list_gates_catalog() {
        let guard = ImportGuard::new(PermissionList::allow(["math"]));
        assert!(guard.load("math", Position::NONE).is_ok());

        let blocked = guard.load("os", Position::NONE).unwrap_err();
        assert_eq!(kind_of(&blocked), ErrorKind::ImportBlocked);
    }

    #[test]
    fn block_list_covers_submodules() {
        let guard = ImportGuard::new(PermissionList::block(["os"]));
        assert!(guard.load("json", Position::NONE).is_ok());
        let blocked = guard.load("os.path", Position::NONE).unwrap_err();
        assert_eq!(kind_of(&blocked), ErrorKind::ImportBlocked);
    }

    #[test]
    fn permitted_but_unknown_module_is_not_found() {
        let guard = ImportGuard::new(PermissionList::allow(["numpy"]));
        let err = guard.load("numpy", Position::NONE).unwrap_err();
        assert!(matches!(*err, EvalAltResult::ErrorModuleNotFound(..)));
    }
}
