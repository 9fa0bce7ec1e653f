//! Explicit build context: parameter naming and storage.

use std::collections::BTreeMap;

use pixeldp_core::{PixelDpError, Result, Tensor};

/// Leaf name of weight matrices and filters (subject to weight decay).
pub const WEIGHTS: &str = "DW";
/// Leaf name of bias vectors.
pub const BIASES: &str = "biases";

/// Join a scope path and a leaf name.
pub fn param_name(scope: &str, leaf: &str) -> String {
    if scope.is_empty() {
        leaf.to_string()
    } else {
        format!("{scope}/{leaf}")
    }
}

/// Named model parameters, owned by the model and updated by the optimizer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamStore {
    params: BTreeMap<String, Tensor>,
}

impl ParamStore {
    /// Look up a parameter.
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.params
            .get(name)
            .ok_or_else(|| PixelDpError::config(format!("missing parameter '{name}'")))
    }

    /// Look up a parameter for in-place update.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Tensor> {
        self.params
            .get_mut(name)
            .ok_or_else(|| PixelDpError::config(format!("missing parameter '{name}'")))
    }

    /// Replace a parameter, keeping its shape.
    pub fn set(&mut self, name: &str, value: Tensor) -> Result<()> {
        let slot = self.get_mut(name)?;
        if slot.shape() != value.shape() {
            return Err(PixelDpError::shape(format!(
                "parameter '{name}' has shape {:?}, got {:?}",
                slot.shape(),
                value.shape()
            )));
        }
        *slot = value;
        Ok(())
    }

    /// Parameter names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// All parameters.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All parameters, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.params.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Weight tensors that contribute to weight decay.
    pub fn decayed(&self) -> impl Iterator<Item = &Tensor> {
        self.params
            .iter()
            .filter(|(k, _)| k.rsplit('/').next() == Some(WEIGHTS))
            .map(|(_, v)| v)
    }

    /// Number of scalar parameters.
    pub fn num_scalars(&self) -> usize {
        self.params.values().map(|t| t.len()).sum()
    }

    /// Number of named tensors.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Scope stack and parameter registry used while building a model.
#[derive(Debug, Default)]
pub struct BuildContext {
    scopes: Vec<String>,
    params: ParamStore,
}

impl BuildContext {
    /// Empty context at the root scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` inside `scope` (which may contain `/`-separated parts).
    pub fn with_scope<T>(&mut self, scope: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let depth = self.scopes.len();
        self.scopes
            .extend(scope.split('/').filter(|s| !s.is_empty()).map(str::to_string));
        let out = f(self);
        self.scopes.truncate(depth);
        out
    }

    /// Current scope path.
    pub fn scope(&self) -> String {
        self.scopes.join("/")
    }

    /// Register a parameter under the current scope.
    pub fn create_param(&mut self, leaf: &str, value: Tensor) -> Result<String> {
        let name = param_name(&self.scope(), leaf);
        if self.params.params.contains_key(&name) {
            return Err(PixelDpError::config(format!("parameter '{name}' already exists")));
        }
        self.params.params.insert(name.clone(), value);
        Ok(name)
    }

    /// Finish building and hand over the parameters.
    pub fn into_params(self) -> ParamStore {
        self.params
    }
}
