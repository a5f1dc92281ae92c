//! Capability interface shared by every network stage.
//!
//! Stages do not own their parameters; they hold a [`ParamScope`] naming the
//! slice of the segmenter's [`VarMap`] they were built under. The orchestrator
//! composes stages and forwards training-mode changes explicitly.

use candle_core::Var;
use candle_nn::VarMap;

use crate::error::{ProbSegError, Result};

/// Named view into a shared variable map.
#[derive(Clone)]
pub struct ParamScope {
    varmap: VarMap,
    prefix: String,
}

impl ParamScope {
    /// Scope over every variable whose name starts with `prefix.`.
    pub fn new(varmap: &VarMap, prefix: impl Into<String>) -> Self {
        Self {
            varmap: varmap.clone(),
            prefix: prefix.into(),
        }
    }

    /// Nested scope `prefix.name`.
    pub fn child(&self, name: &str) -> Self {
        Self::new(&self.varmap, format!("{}.{name}", self.prefix))
    }

    /// The shared variable map.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Name prefix of this scope.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Variables in this scope, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned.
    pub fn vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| ProbSegError::Training("variable map lock poisoned".into()))?;
        let scope = format!("{}.", self.prefix);
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| name.starts_with(&scope))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Total number of scalar parameters in this scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned.
    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self.vars()?.iter().map(|(_, v)| v.elem_count()).sum())
    }
}

impl std::fmt::Debug for ParamScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamScope")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// A network stage: exposes its parameters and accepts training-mode changes.
pub trait Component {
    /// Parameter scope the stage was built under.
    fn scope(&self) -> &ParamScope;

    /// Parameters of this stage, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable map lock is poisoned.
    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        self.scope().vars()
    }

    /// Switch between training and inference behaviour.
    ///
    /// Stages without mode-dependent layers ignore this.
    fn set_training(&mut self, _training: bool) {}

    /// Whether the stage currently runs in training mode.
    fn is_training(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_scope_filters_by_prefix() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.pp("prior").get_with_hints((2, 3), "w", Init::Const(0.0))?;
        vb.pp("prior").get_with_hints(3, "b", Init::Const(0.0))?;
        vb.pp("prior2").get_with_hints(5, "w", Init::Const(0.0))?;

        let scope = ParamScope::new(&varmap, "prior");
        let names: Vec<String> = scope.vars()?.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["prior.b".to_string(), "prior.w".to_string()]);
        assert_eq!(scope.num_parameters()?, 9);
        Ok(())
    }
}
